//! Line-delimited JSON commands accepted by the worker binary.
//!
//! ```text
//! {"op":"submit","source":"cat.png","output":"a.svg","options":{"mode":"polygon"}}
//! {"op":"cancel","output":"a.svg"}
//! ```

use crate::converter;
use crate::job::ConversionOptions;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Command {
    Submit {
        source: PathBuf,
        #[serde(default)]
        output: Option<PathBuf>,
        #[serde(default)]
        options: ConversionOptions,
    },
    Cancel {
        output: PathBuf,
    },
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }

    /// Output path this command refers to. Submissions without one write
    /// next to the source.
    pub fn output_path(&self) -> PathBuf {
        match self {
            Command::Submit {
                source,
                output: None,
                ..
            } => converter::default_output_path(source),
            Command::Submit {
                output: Some(output),
                ..
            } => output.clone(),
            Command::Cancel { output } => output.clone(),
        }
    }
}
