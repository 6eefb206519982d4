use anyhow::{Context, Result, bail};
use kiln_core::prelude::*;
use std::path::PathBuf;

/// Parses `key=value`. The value is read as JSON when it parses, otherwise as a string.
pub fn parse_param(raw: &str) -> Result<(String, serde_json::Value)> {
    let (key, value) = split(raw)?;
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

/// Parses `slot=path`.
pub fn parse_input(raw: &str) -> Result<(String, PathBuf)> {
    let (slot, path) = split(raw)?;
    Ok((slot.to_string(), PathBuf::from(path)))
}

fn split(raw: &str) -> Result<(&str, &str)> {
    let (key, value) = raw
        .split_once('=')
        .with_context(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        bail!("empty key in '{raw}'");
    }
    Ok((key, value))
}

pub fn build_request(
    model: String,
    id: Option<String>,
    params: &[String],
    inputs: &[String],
) -> Result<JobRequest> {
    let mut request = JobRequest::new(model);
    request.id = id;
    for raw in params {
        let (key, value) = parse_param(raw)?;
        request.params.insert(key, value);
    }
    for raw in inputs {
        let (slot, path) = parse_input(raw)?;
        request.inputs.insert(slot, path);
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_are_typed_when_possible() {
        assert_eq!(parse_param("scale=4").unwrap(), ("scale".into(), json!(4)));
        assert_eq!(parse_param("speed=1.25").unwrap(), ("speed".into(), json!(1.25)));
        assert_eq!(parse_param("half=true").unwrap(), ("half".into(), json!(true)));
        assert_eq!(
            parse_param("voice=female1").unwrap(),
            ("voice".into(), json!("female1"))
        );
        assert_eq!(
            parse_param("prompt=a=b").unwrap(),
            ("prompt".into(), json!("a=b"))
        );
    }

    #[test]
    fn malformed_pairs_are_rejected() {
        assert!(parse_param("scale").is_err());
        assert!(parse_input("=/data/a.png").is_err());
    }

    #[test]
    fn request_from_flags() {
        let request = build_request(
            "stableavatar".into(),
            Some("avatar-1".into()),
            &["steps=30".into()],
            &["image=/data/input/image/me.png".into(), "audio=/data/input/audio/hi.wav".into()],
        )
        .unwrap();

        assert_eq!(request.id.as_deref(), Some("avatar-1"));
        assert_eq!(request.params["steps"], json!(30));
        assert_eq!(
            request.inputs["audio"],
            PathBuf::from("/data/input/audio/hi.wav")
        );
    }
}
