//! Upstream sample sources
//!
//! Everything downstream of ingestion talks to a `Source` and never learns
//! which implementation is active. New sources are added by implementing the
//! trait, adding a `SourceSpec` variant and wiring it into `create_source`.
//!
//! Current implementations:
//! - `SyntheticSource`: generated band power with a slow focus oscillation
//! - `HardwareSource`: frames piped from an acquisition process (stdin or file)
//! - `DatagramSource`: frames received as UDP datagrams

mod datagram;
mod hardware;
mod synthetic;

pub use datagram::DatagramSource;
pub use hardware::HardwareSource;
pub use synthetic::{focus_level, SyntheticConfig, SyntheticSource};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{FocusError, FocusResult};
use crate::types::Sample;

/// What one pull from a source produced
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SourceEvent {
    Sample(Sample),
    /// Nothing arrived within the timeout
    Timeout,
    /// The source is exhausted; the pipeline shuts down normally
    EndOfStream,
}

/// Producer of band-power samples
pub trait Source: Send {
    /// Short name for logs
    fn name(&self) -> &str;

    /// Block for at most `timeout` waiting for the next sample.
    ///
    /// A malformed frame is reported as `InvalidSample`; the caller drops it
    /// and keeps pulling.
    fn next_sample(&mut self, timeout: Duration) -> FocusResult<SourceEvent>;

    /// Try to re-establish the upstream after a disconnect
    fn reconnect(&mut self) -> FocusResult<()> {
        Ok(())
    }
}

/// Which source to construct
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    Synthetic(SyntheticConfig),
    /// Frames on stdin (`path: None`) or from a file / device node
    Hardware { path: Option<PathBuf> },
    /// Frames as datagrams on a bound UDP address
    Datagram { bind: String },
}

impl FromStr for SourceSpec {
    type Err = FocusError;

    /// Parse a CLI source identifier:
    /// `synthetic`, `synthetic:<seed>`, `stdin`, `file:<path>`, `udp:<host:port>`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (kind, arg) = match s.split_once(':') {
            Some((kind, arg)) => (kind, Some(arg)),
            None => (s, None),
        };

        match (kind.to_ascii_lowercase().as_str(), arg) {
            ("synthetic" | "demo", None) => Ok(SourceSpec::Synthetic(SyntheticConfig::default())),
            ("synthetic" | "demo", Some(seed)) => {
                let seed = seed.parse::<u64>().map_err(|_| {
                    FocusError::InvalidConfig(format!("bad synthetic seed '{seed}'"))
                })?;
                Ok(SourceSpec::Synthetic(SyntheticConfig {
                    seed: Some(seed),
                    ..SyntheticConfig::default()
                }))
            }
            ("stdin" | "-", None) | ("hardware", None) => Ok(SourceSpec::Hardware { path: None }),
            ("file" | "hardware", Some(path)) if !path.is_empty() => Ok(SourceSpec::Hardware {
                path: Some(PathBuf::from(path)),
            }),
            ("udp", Some(bind)) if !bind.is_empty() => Ok(SourceSpec::Datagram {
                bind: bind.to_string(),
            }),
            _ => Err(FocusError::InvalidConfig(format!(
                "unknown source '{s}' (expected synthetic, stdin, file:<path> or udp:<addr>)"
            ))),
        }
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Synthetic(config) => match config.seed {
                Some(seed) => write!(f, "synthetic:{seed}"),
                None => f.write_str("synthetic"),
            },
            SourceSpec::Hardware { path: None } => f.write_str("stdin"),
            SourceSpec::Hardware { path: Some(path) } => write!(f, "file:{}", path.display()),
            SourceSpec::Datagram { bind } => write!(f, "udp:{bind}"),
        }
    }
}

/// Construct a source; any failure here is `SourceInit` and fatal
pub fn create_source(spec: &SourceSpec) -> FocusResult<Box<dyn Source>> {
    let source: Box<dyn Source> = match spec {
        SourceSpec::Synthetic(config) => Box::new(SyntheticSource::new(config.clone())?),
        SourceSpec::Hardware { path: None } => Box::new(HardwareSource::stdin()),
        SourceSpec::Hardware { path: Some(path) } => Box::new(HardwareSource::open(path)?),
        SourceSpec::Datagram { bind } => Box::new(DatagramSource::bind(bind)?),
    };
    tracing::info!(source = %spec, "upstream source ready");
    Ok(source)
}

#[derive(Deserialize)]
struct Frame {
    #[serde(alias = "power", alias = "beta_power")]
    band_power: f64,
    #[serde(default, alias = "ts")]
    timestamp: Option<f64>,
}

/// Parse one upstream frame.
///
/// Accepted forms: `{"band_power": 12.3, "timestamp": 4.5}`, `4.5,12.3`
/// (timestamp, power) or a bare `12.3`. Frames without a timestamp are stamped
/// with `received_at`.
pub(crate) fn parse_frame(text: &str, received_at: f64) -> FocusResult<Sample> {
    let text = text.trim();
    let sample = if text.starts_with('{') {
        let frame: Frame = serde_json::from_str(text)
            .map_err(|e| FocusError::InvalidSample(format!("bad frame: {e}")))?;
        Sample::new(frame.band_power, frame.timestamp.unwrap_or(received_at))
    } else {
        let number = |part: &str| {
            part.trim()
                .parse::<f64>()
                .map_err(|_| FocusError::InvalidSample(format!("bad frame '{text}'")))
        };
        match text.split_once(',') {
            Some((ts, power)) => Sample::new(number(power)?, number(ts)?),
            None => Sample::new(number(text)?, received_at),
        }
    };
    sample.validate()?;
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_spec() {
        assert_eq!(
            "synthetic".parse::<SourceSpec>().unwrap(),
            SourceSpec::Synthetic(SyntheticConfig::default())
        );
        match "synthetic:7".parse::<SourceSpec>().unwrap() {
            SourceSpec::Synthetic(config) => assert_eq!(config.seed, Some(7)),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            "stdin".parse::<SourceSpec>().unwrap(),
            SourceSpec::Hardware { path: None }
        );
        assert_eq!(
            "file:/tmp/eeg.ndjson".parse::<SourceSpec>().unwrap(),
            SourceSpec::Hardware {
                path: Some(PathBuf::from("/tmp/eeg.ndjson"))
            }
        );
        assert_eq!(
            "udp:127.0.0.1:9000".parse::<SourceSpec>().unwrap(),
            SourceSpec::Datagram {
                bind: "127.0.0.1:9000".into()
            }
        );
        assert!("cyton".parse::<SourceSpec>().is_err());
        assert!("synthetic:abc".parse::<SourceSpec>().is_err());
        assert!("udp:".parse::<SourceSpec>().is_err());
    }

    #[test]
    fn test_spec_display_parses_back() {
        for raw in ["synthetic", "synthetic:3", "stdin", "file:/dev/ttyUSB0", "udp:0.0.0.0:7000"] {
            let spec: SourceSpec = raw.parse().unwrap();
            assert_eq!(spec.to_string(), raw);
        }
    }

    #[test]
    fn test_parse_frame_forms() {
        assert_eq!(
            parse_frame(r#"{"band_power": 12.5, "timestamp": 3.0}"#, 9.0).unwrap(),
            Sample::new(12.5, 3.0)
        );
        assert_eq!(
            parse_frame(r#"{"power": 2.0}"#, 9.0).unwrap(),
            Sample::new(2.0, 9.0)
        );
        assert_eq!(parse_frame("1.5, 40", 9.0).unwrap(), Sample::new(40.0, 1.5));
        assert_eq!(parse_frame(" 33.0\n", 9.0).unwrap(), Sample::new(33.0, 9.0));
    }

    #[test]
    fn test_parse_frame_rejects_bad_input() {
        for raw in ["", "abc", "-4.0", "NaN", r#"{"timestamp": 1.0}"#, "1.0,x"] {
            assert!(
                matches!(parse_frame(raw, 0.0), Err(FocusError::InvalidSample(_))),
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn test_missing_file_is_init_error() {
        let spec = SourceSpec::Hardware {
            path: Some(PathBuf::from("/nonexistent/eeg.ndjson")),
        };
        let err = create_source(&spec).err().unwrap();
        assert!(matches!(err, FocusError::SourceInit(_)));
        assert!(err.is_fatal());
    }
}
