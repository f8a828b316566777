use std::io;
use anyhow::{anyhow, bail};
use bytes::{BufMut, BytesMut};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;
use crate::codec::WireCodec;
use crate::config::CodecKind;
use crate::frame::{Fragment, FragmentHeader, MessageId};

/// Self-describing envelope, one compact JSON object per datagram:
///
/// ```json
/// {"type":"ascan_s21_json","msg_id":"<hex>","part":0,"total_parts":3,"n_samples":501,"data":[0.5,...],"ts":1700000000000}
/// ```
///
/// `ts` is the capture time in millis since epoch. Non-finite samples can not be represented as
///  JSON numbers, they are written as the strings `"NaN"`, `"Infinity"` and `"-Infinity"`.
pub struct JsonCodec {
    frame_kind: String,
    accepted_frame_kinds: Vec<String>,
}

impl JsonCodec {
    pub fn new(frame_kind: String, accepted_frame_kinds: Vec<String>) -> JsonCodec {
        JsonCodec {
            frame_kind,
            accepted_frame_kinds,
        }
    }

    fn envelope<'a>(&'a self, header: &'a FragmentHeader, msg_id: &'a str, samples: &'a [f64]) -> anyhow::Result<OutgoingEnvelope<'a>> {
        Ok(OutgoingEnvelope {
            kind: &self.frame_kind,
            msg_id,
            part: header.part_index,
            total_parts: header.part_count,
            n_samples: header.sample_count
                .ok_or_else(|| anyhow!("JSON envelope requires the frame's sample count"))?,
            data: Samples(samples),
            ts: header.capture_ts_ms.or(header.send_ts_ms).unwrap_or(0),
        })
    }
}

fn text_id(msg_id: &MessageId) -> anyhow::Result<&str> {
    match msg_id {
        MessageId::Text(s) => Ok(s),
        MessageId::Numeric(n) => bail!("JSON envelope requires a text message id, got {}", n),
    }
}

impl WireCodec for JsonCodec {
    fn kind(&self) -> CodecKind {
        CodecKind::Json
    }

    fn next_message_id(&self) -> MessageId {
        MessageId::Text(Uuid::new_v4().simple().to_string())
    }

    fn encode(&self, header: &FragmentHeader, samples: &[f64], buf: &mut BytesMut) -> anyhow::Result<()> {
        let envelope = self.envelope(header, text_id(&header.msg_id)?, samples)?;
        serde_json::to_writer(buf.writer(), &envelope)?;
        Ok(())
    }

    fn encoded_len(&self, header: &FragmentHeader, samples: &[f64]) -> anyhow::Result<usize> {
        let envelope = self.envelope(header, text_id(&header.msg_id)?, samples)?;
        let mut counter = ByteCounter(0);
        serde_json::to_writer(&mut counter, &envelope)?;
        Ok(counter.0)
    }

    fn decode(&self, datagram: &[u8]) -> anyhow::Result<Option<Fragment>> {
        let raw: IncomingEnvelope = serde_json::from_slice(datagram)?;
        if !self.accepted_frame_kinds.contains(&raw.kind) {
            return Ok(None);
        }

        let msg_id = match raw.msg_id {
            Some(id) if !id.is_empty() => id,
            _ => bail!("missing msg_id"),
        };
        let (Some(part), Some(total_parts), Some(n_samples), Some(data)) = (raw.part, raw.total_parts, raw.n_samples, raw.data) else {
            bail!("incomplete envelope for message {}", msg_id);
        };

        let samples = data.into_iter()
            .map(|s| s.into_f64())
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Some(Fragment {
            header: FragmentHeader {
                msg_id: MessageId::Text(msg_id),
                part_index: part,
                part_count: total_parts,
                sample_count: Some(n_samples),
                capture_ts_ms: raw.ts.as_ref().and_then(timestamp_millis),
                send_ts_ms: None,
            },
            samples,
        }))
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    msg_id: &'a str,
    part: u32,
    total_parts: u32,
    n_samples: u32,
    data: Samples<'a>,
    ts: u64,
}

struct Samples<'a>(&'a [f64]);

impl Serialize for Samples<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
        for &s in self.0 {
            if s.is_finite() {
                seq.serialize_element(&s)?;
            }
            else if s.is_nan() {
                seq.serialize_element("NaN")?;
            }
            else if s > 0.0 {
                seq.serialize_element("Infinity")?;
            }
            else {
                seq.serialize_element("-Infinity")?;
            }
        }
        seq.end()
    }
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(rename = "type")]
    kind: String,
    msg_id: Option<String>,
    part: Option<u32>,
    total_parts: Option<u32>,
    n_samples: Option<u32>,
    data: Option<Vec<IncomingSample>>,
    /// senders disagree on the timestamp format, so it is parsed leniently and never rejects
    ///  a fragment
    ts: Option<serde_json::Value>,
}

/// Integers are millis since epoch, fractional numbers are seconds since epoch. Anything else
///  (e.g. a formatted date) carries no usable capture time.
fn timestamp_millis(ts: &serde_json::Value) -> Option<u64> {
    if let Some(millis) = ts.as_u64() {
        return Some(millis);
    }
    match ts.as_f64() {
        Some(secs) if secs.is_finite() && secs >= 0.0 => Some((secs * 1000.0).round() as u64),
        _ => None,
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IncomingSample {
    Number(f64),
    NonFinite(String),
}

impl IncomingSample {
    fn into_f64(self) -> anyhow::Result<f64> {
        match self {
            IncomingSample::Number(n) => Ok(n),
            IncomingSample::NonFinite(s) => match s.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                _ => bail!("invalid sample {:?}", s),
            }
        }
    }
}

struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn codec() -> JsonCodec {
        JsonCodec::new("ascan_s21_json".to_string(), vec!["ascan_s21_json".to_string(), "s21_real_u_csv".to_string()])
    }

    fn header() -> FragmentHeader {
        FragmentHeader {
            msg_id: MessageId::Text("abc".to_string()),
            part_index: 1,
            part_count: 2,
            sample_count: Some(3),
            capture_ts_ms: Some(1234),
            send_ts_ms: None,
        }
    }

    #[test]
    fn test_encode_compact() {
        let mut buf = BytesMut::new();
        codec().encode(&header(), &[0.5, -1.0, 3.25], &mut buf).unwrap();
        assert_eq!(
            std::str::from_utf8(&buf).unwrap(),
            r#"{"type":"ascan_s21_json","msg_id":"abc","part":1,"total_parts":2,"n_samples":3,"data":[0.5,-1.0,3.25],"ts":1234}"#
        );
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::single(vec![1.0])]
    #[case::mixed(vec![0.1, -7.75, 1e-20, 3.4e38])]
    #[case::non_finite(vec![f64::INFINITY, 0.0, f64::NEG_INFINITY])]
    fn test_encoded_len_matches_encode(#[case] samples: Vec<f64>) {
        let mut buf = BytesMut::new();
        codec().encode(&header(), &samples, &mut buf).unwrap();
        assert_eq!(codec().encoded_len(&header(), &samples).unwrap(), buf.len());
    }

    #[test]
    fn test_decode_non_finite() {
        let mut buf = BytesMut::new();
        codec().encode(&header(), &[f64::NAN, f64::INFINITY, f64::NEG_INFINITY], &mut buf).unwrap();
        assert!(std::str::from_utf8(&buf).unwrap().contains(r#""data":["NaN","Infinity","-Infinity"]"#));

        let fragment = codec().decode(&buf).unwrap().unwrap();
        assert!(fragment.samples[0].is_nan());
        assert_eq!(fragment.samples[1], f64::INFINITY);
        assert_eq!(fragment.samples[2], f64::NEG_INFINITY);
    }

    #[test]
    fn test_decode() {
        let fragment = codec()
            .decode(br#"{"type":"s21_real_u_csv","msg_id":"m1","part":0,"total_parts":1,"n_samples":2,"data":[1,2.5],"ts":99,"extra":true}"#)
            .unwrap()
            .unwrap();
        assert_eq!(fragment, Fragment {
            header: FragmentHeader {
                msg_id: MessageId::Text("m1".to_string()),
                part_index: 0,
                part_count: 1,
                sample_count: Some(2),
                capture_ts_ms: Some(99),
                send_ts_ms: None,
            },
            samples: vec![1.0, 2.5],
        });
    }

    #[rstest]
    #[case::millis(r#"1717243200123"#, Some(1717243200123))]
    #[case::float_seconds(r#"1717243200.123"#, Some(1717243200123))]
    #[case::formatted_date(r#""2025-06-01T12:00:00""#, None)]
    #[case::negative(r#"-5"#, None)]
    #[case::null(r#"null"#, None)]
    #[case::object(r#"{"sec":1}"#, None)]
    fn test_decode_timestamp_formats(#[case] ts: &str, #[case] expected: Option<u64>) {
        let datagram = format!(
            r#"{{"type":"ascan_s21_json","msg_id":"m1","part":0,"total_parts":1,"n_samples":1,"data":[0.5],"ts":{},"params":{{"gain":12}}}}"#,
            ts
        );
        let fragment = codec().decode(datagram.as_bytes()).unwrap().unwrap();
        assert_eq!(fragment.header.capture_ts_ms, expected);
        assert_eq!(fragment.samples, vec![0.5]);
    }

    #[test]
    fn test_decode_without_timestamp() {
        let fragment = codec()
            .decode(br#"{"type":"ascan_s21_json","msg_id":"m1","part":0,"total_parts":1,"n_samples":0,"data":[]}"#)
            .unwrap()
            .unwrap();
        assert_eq!(fragment.header.capture_ts_ms, None);
    }

    #[test]
    fn test_samples_keep_double_precision() {
        let samples = [-45.123456789, 0.1, 1e-300, 123456789.123456789];

        let fragment = codec()
            .decode(br#"{"type":"ascan_s21_json","msg_id":"m1","part":0,"total_parts":1,"n_samples":4,"data":[-45.123456789,0.1,1e-300,123456789.123456789],"ts":1}"#)
            .unwrap()
            .unwrap();
        assert_eq!(fragment.samples, samples);

        let mut buf = BytesMut::new();
        codec().encode(&FragmentHeader { sample_count: Some(4), ..header() }, &samples, &mut buf).unwrap();
        assert_eq!(codec().decode(&buf).unwrap().unwrap().samples, samples);
    }

    #[rstest]
    #[case::other_kind(br#"{"type":"gps","lat":1.0}"#.as_slice())]
    #[case::control(br#"{"type":"CTRL","cmd":"START","interval_ms":50,"msg_id":"abc","ts_ms":1}"#.as_slice())]
    fn test_decode_ignores_unknown_kind(#[case] datagram: &[u8]) {
        assert_eq!(codec().decode(datagram).unwrap(), None);
    }

    #[rstest]
    #[case::not_json(b"hello".as_slice())]
    #[case::binary(b"ASCN\0\0\0\x01".as_slice())]
    #[case::no_type(br#"{"msg_id":"a"}"#.as_slice())]
    #[case::empty_id(br#"{"type":"ascan_s21_json","msg_id":"","part":0,"total_parts":1,"n_samples":0,"data":[],"ts":0}"#.as_slice())]
    #[case::missing_part(br#"{"type":"ascan_s21_json","msg_id":"a","total_parts":1,"n_samples":0,"data":[],"ts":0}"#.as_slice())]
    #[case::missing_data(br#"{"type":"ascan_s21_json","msg_id":"a","part":0,"total_parts":1,"n_samples":0,"ts":0}"#.as_slice())]
    #[case::negative_part(br#"{"type":"ascan_s21_json","msg_id":"a","part":-1,"total_parts":1,"n_samples":0,"data":[],"ts":0}"#.as_slice())]
    #[case::bad_sample(br#"{"type":"ascan_s21_json","msg_id":"a","part":0,"total_parts":1,"n_samples":1,"data":["x"],"ts":0}"#.as_slice())]
    fn test_decode_malformed(#[case] datagram: &[u8]) {
        assert!(codec().decode(datagram).is_err());
    }

    #[test]
    fn test_message_ids() {
        let MessageId::Text(id) = codec().next_message_id() else { panic!("expected text id") };
        assert_eq!(id.len(), 32);
        assert_ne!(codec().next_message_id(), codec().next_message_id());
    }
}
