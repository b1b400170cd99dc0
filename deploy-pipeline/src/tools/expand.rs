// Variable Expansion
// `${NAME}` substitution in typed step action fields

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RenderError {
    #[error("undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("unterminated variable reference in '{0}'")]
    Unterminated(String),

    #[error("credential '{0}' was not resolved")]
    MissingCredential(String),
}

/// Substitute every `${NAME}` in `input` from `vars`.
///
/// A `$` not followed by `{` is kept literally. Unknown names are an error so
/// that a typo never reaches an external tool as an empty string.
pub fn expand(input: &str, vars: &HashMap<String, String>) -> Result<String, RenderError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| RenderError::Unterminated(input.to_string()))?;
        let name = &after[..end];
        let value = vars
            .get(name)
            .ok_or_else(|| RenderError::UndefinedVariable(name.to_string()))?;
        out.push_str(value);
        rest = &after[end + 1..];
    }

    out.push_str(rest);
    Ok(out)
}
