use std::path::PathBuf;

use codecall_protocol::CallType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A user call to run `function` from `file` in a question or element directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub call_type: CallType,
    /// Question or element directory, relative to its tree
    pub directory: Option<String>,
    /// Module name without extension (e.g. `server`)
    pub file: String,
    pub function: String,
    pub args: Vec<Value>,
}

impl CallRequest {
    pub fn new(call_type: CallType, file: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            call_type,
            directory: None,
            file: file.into(),
            function: function.into(),
            args: Vec::new(),
        }
    }

    pub fn with_directory(mut self, directory: impl Into<String>) -> Self {
        self.directory = Some(directory.into());
        self
    }

    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }
}

/// Result of a successful call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallOutput {
    /// Value returned by the function
    pub data: Value,
    /// Everything the child wrote to stdout and stderr during the call, in arrival order
    pub output: String,
}

/// Course a worker should serve next
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrepareForCourse {
    pub course_path: PathBuf,
    /// Python modules the child must refuse to import
    pub forbidden_modules: Vec<String>,
}

impl PrepareForCourse {
    pub fn new(course_path: impl Into<PathBuf>) -> Self {
        Self {
            course_path: course_path.into(),
            forbidden_modules: Vec::new(),
        }
    }

    pub fn with_forbidden_modules(mut self, modules: Vec<String>) -> Self {
        self.forbidden_modules = modules;
        self
    }
}
