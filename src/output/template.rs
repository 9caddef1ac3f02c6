//! Template-format rendering.

use std::path::Path;

use serde_json::{Map, Value};
use tera::{Context, Tera};

use crate::errors::{Error, Result};

/// Render the template at `template_file` with the secret payload as its
/// context. Autoescaping is off: the output is arbitrary configuration
/// text, not HTML.
pub async fn render(template_file: &Path, data: &Map<String, Value>) -> Result<String> {
    let template = tokio::fs::read_to_string(template_file).await.map_err(|e| {
        Error::resource(format!(
            "unable to read template file {}: {}",
            template_file.display(),
            e
        ))
    })?;

    let context = Context::from_serialize(data)?;
    Ok(Tera::one_off(&template, &context, false)?)
}
