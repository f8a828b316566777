pub mod backoff;
pub mod stop_signal;
