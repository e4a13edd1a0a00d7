//! Call types and the request line written to the child's stdin.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Kind of call issued to a worker
///
/// `Restart` and `Ping` are internal: the worker issues them itself to reset
/// or probe the child and they never reach course code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallType {
    /// Question server code under `<course>/questions/<directory>`
    Question,
    /// Course-provided element under `<course>/elements/<directory>`
    CourseElement,
    /// Built-in element under `<builtin>/elements/<directory>`
    CoreElement,
    /// Return the forked worker to the zygote
    Restart,
    /// Liveness probe answered by the zygote
    Ping,
}

impl CallType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallType::Question => "question",
            CallType::CourseElement => "course-element",
            CallType::CoreElement => "core-element",
            CallType::Restart => "restart",
            CallType::Ping => "ping",
        }
    }

    /// Whether the worker issues this call on its own behalf
    pub fn is_internal(&self) -> bool {
        matches!(self, CallType::Restart | CallType::Ping)
    }

    /// Whether the call needs a directory inside the course or builtin tree
    pub fn needs_directory(&self) -> bool {
        matches!(
            self,
            CallType::Question | CallType::CourseElement | CallType::CoreElement
        )
    }

    /// Whether the call runs code from the course checkout
    pub fn needs_course(&self) -> bool {
        matches!(self, CallType::Question | CallType::CourseElement)
    }
}

impl fmt::Display for CallType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallType {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "question" => Ok(CallType::Question),
            "course-element" => Ok(CallType::CourseElement),
            "core-element" => Ok(CallType::CoreElement),
            "restart" => Ok(CallType::Restart),
            "ping" => Ok(CallType::Ping),
            other => Err(ProtocolError::UnknownCallType(other.to_string())),
        }
    }
}

/// Request line read by the zygote's worker loop
///
/// `file` is `null` for the internal calls; the zygote recognises them by
/// `fcn` alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireRequest {
    pub file: Option<String>,
    pub fcn: String,
    pub args: Vec<Value>,
    pub cwd: Option<String>,
    pub paths: Vec<String>,
    #[serde(default)]
    pub forbidden_modules: Vec<String>,
}

impl WireRequest {
    /// Request for one of the internal calls
    pub fn internal(call_type: CallType, paths: Vec<String>) -> Self {
        Self {
            file: None,
            fcn: call_type.as_str().to_string(),
            args: Vec::new(),
            cwd: None,
            paths,
            forbidden_modules: Vec::new(),
        }
    }

    /// Serialize to a JSON line (with newline)
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut json = serde_json::to_string(self).map_err(ProtocolError::Encode)?;
        json.push('\n');
        Ok(json)
    }

    /// Deserialize from a JSON line
    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::malformed("request", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_type_parsing() {
        assert_eq!("question".parse::<CallType>().unwrap(), CallType::Question);
        assert_eq!(
            "course-element".parse::<CallType>().unwrap(),
            CallType::CourseElement
        );
        assert_eq!(
            "core-element".parse::<CallType>().unwrap(),
            CallType::CoreElement
        );

        let err = "v2-question".parse::<CallType>().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCallType(ref t) if t == "v2-question"));
    }

    #[test]
    fn test_call_type_serde_matches_as_str() {
        for ty in [
            CallType::Question,
            CallType::CourseElement,
            CallType::CoreElement,
            CallType::Restart,
            CallType::Ping,
        ] {
            let encoded = serde_json::to_value(ty).unwrap();
            assert_eq!(encoded, json!(ty.as_str()));
        }
    }

    #[test]
    fn test_call_type_classification() {
        assert!(CallType::Ping.is_internal());
        assert!(CallType::Restart.is_internal());
        assert!(!CallType::Question.is_internal());

        assert!(CallType::CoreElement.needs_directory());
        assert!(!CallType::CoreElement.needs_course());
        assert!(CallType::CourseElement.needs_course());
        assert!(!CallType::Ping.needs_directory());
    }

    #[test]
    fn test_request_line_shape() {
        let req = WireRequest {
            file: Some("server".into()),
            fcn: "generate".into(),
            args: vec![json!(7)],
            cwd: Some("/course/questions/addNumbers".into()),
            paths: vec!["/app/python".into()],
            forbidden_modules: vec!["os".into()],
        };
        let line = req.to_line().unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""fcn":"generate""#));

        let parsed = WireRequest::from_line(&line).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_internal_request_has_null_file() {
        let line = WireRequest::internal(CallType::Ping, vec![])
            .to_line()
            .unwrap();
        assert!(line.contains(r#""file":null"#));
        assert!(line.contains(r#""fcn":"ping""#));
    }

    #[test]
    fn test_request_without_forbidden_modules() {
        let parsed = WireRequest::from_line(
            r#"{"file":null,"fcn":"restart","args":[],"cwd":null,"paths":[]}"#,
        )
        .unwrap();
        assert!(parsed.forbidden_modules.is_empty());
    }
}
