//! Activation arguments -- the payload a second launch forwards to the
//! primary instance.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

/// How the process was activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Plain launch, optionally with command-line arguments.
    Launch,
    /// Launched through the application's URI scheme.
    Protocol,
    /// Launched to open one or more files.
    File,
}

/// Original launch arguments plus a flag marking them as redirected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HutaoActivationArguments {
    /// Set by the client before forwarding to the primary instance.
    #[serde(default)]
    pub is_redirected: bool,
    pub kind: ActivationKind,
    #[serde(default)]
    pub launch_arguments: Option<String>,
    #[serde(default)]
    pub protocol_uri: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

impl HutaoActivationArguments {
    pub fn launch(arguments: Option<String>) -> Self {
        Self {
            is_redirected: false,
            kind: ActivationKind::Launch,
            launch_arguments: arguments,
            protocol_uri: None,
            files: Vec::new(),
        }
    }

    pub fn protocol(uri: &Url) -> Self {
        Self {
            is_redirected: false,
            kind: ActivationKind::Protocol,
            launch_arguments: None,
            protocol_uri: Some(uri.to_string()),
            files: Vec::new(),
        }
    }

    pub fn files(files: Vec<String>) -> Self {
        Self {
            is_redirected: false,
            kind: ActivationKind::File,
            launch_arguments: None,
            protocol_uri: None,
            files,
        }
    }

    /// Classify process arguments (program name already stripped).
    ///
    /// A single URL in `scheme` is a protocol activation; arguments that all
    /// name existing files are a file activation; anything else is a launch.
    pub fn from_command_line<I, S>(args: I, scheme: &str) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();

        if let [single] = args.as_slice() {
            if let Ok(uri) = Url::parse(single) {
                if uri.scheme().eq_ignore_ascii_case(scheme) {
                    return Self::protocol(&uri);
                }
            }
        }

        if !args.is_empty() && args.iter().all(|a| Path::new(a).is_file()) {
            return Self::files(args);
        }

        if args.is_empty() {
            Self::launch(None)
        } else {
            Self::launch(Some(args.join(" ")))
        }
    }

    /// Copy of these arguments marked as redirected.
    pub fn redirected(&self) -> Self {
        Self {
            is_redirected: true,
            ..self.clone()
        }
    }
}
