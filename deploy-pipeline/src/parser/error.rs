// Parser Errors
// Located parse errors with source excerpts, plus semantic validation findings

use std::fmt;

/// Parse error pointing at a line and column of the definition file
#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    /// 1-indexed; 0 when the error has no location (e.g. unreadable file)
    pub line: usize,
    pub column: usize,
    /// Excerpt of the surrounding source lines
    pub context: String,
    pub suggestion: Option<String>,
    pub kind: ParseErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseErrorKind {
    /// Malformed YAML or a value of the wrong shape
    Syntax,
    /// Field name the schema does not know
    UnknownField,
    /// Required field absent
    MissingField,
    /// File could not be read
    Io,
}

impl ParseError {
    pub fn new(message: impl Into<String>, line: usize, column: usize) -> Self {
        Self {
            message: message.into(),
            line,
            column,
            context: String::new(),
            suggestion: None,
            kind: ParseErrorKind::Syntax,
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(message, 0, 0).with_kind(ParseErrorKind::Io)
    }

    pub fn with_kind(mut self, kind: ParseErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Attach the lines around the error location, marking the offending one
    pub fn with_source_context(mut self, source: &str, context_lines: usize) -> Self {
        if self.line == 0 {
            return self;
        }

        let lines: Vec<&str> = source.lines().collect();
        let start = self.line.saturating_sub(context_lines + 1);
        let end = (self.line + context_lines).min(lines.len());

        let mut context = String::new();
        for (i, line) in lines.iter().enumerate().take(end).skip(start) {
            let line_num = i + 1;
            let marker = if line_num == self.line { ">" } else { " " };
            context.push_str(&format!("{} {:4} | {}\n", marker, line_num, line));

            if line_num == self.line && self.column > 0 {
                context.push_str(&format!("       | {}^\n", " ".repeat(self.column - 1)));
            }
        }

        self.context = context;
        self
    }

    pub fn from_yaml_error(err: &serde_yaml::Error, source: &str) -> Self {
        let (line, column) = err
            .location()
            .map(|loc| (loc.line(), loc.column()))
            .unwrap_or((0, 0));

        let raw = err.to_string();
        let (message, kind) = describe_yaml_error(&raw);

        let mut error = ParseError::new(message, line, column)
            .with_kind(kind)
            .with_source_context(source, 2);
        error.suggestion = suggest_fix(&raw, source, line);
        error
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "error: {}", self.message)?;
        if self.line > 0 {
            writeln!(f, "  --> line {}:{}", self.line, self.column)?;
        }

        if !self.context.is_empty() {
            writeln!(f)?;
            write!(f, "{}", self.context)?;
        }

        if let Some(suggestion) = &self.suggestion {
            writeln!(f)?;
            writeln!(f, "help: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ParseError {}

pub type ParseResult<T> = Result<T, ParseError>;

fn describe_yaml_error(msg: &str) -> (String, ParseErrorKind) {
    if let Some(field) = between(msg, "missing field `", "`") {
        return (
            format!("missing required field '{}'", field),
            ParseErrorKind::MissingField,
        );
    }

    if let Some(field) = between(msg, "unknown field `", "`") {
        let message = match expected_fields(msg) {
            Some(expected) => format!(
                "unknown field '{}', expected one of: {}",
                field,
                expected.join(", ")
            ),
            None => format!("unknown field '{}'", field),
        };
        return (message, ParseErrorKind::UnknownField);
    }

    if let Some(variant) = between(msg, "unknown variant `", "`") {
        return (
            format!("unknown step action '{}'", variant),
            ParseErrorKind::UnknownField,
        );
    }

    if msg.contains("invalid type") {
        if let (Some(expected), Some(found)) = (between(msg, "expected ", " at"), between(msg, "invalid type: ", ",")) {
            return (
                format!("expected {}, but found {}", expected, found),
                ParseErrorKind::Syntax,
            );
        }
    }

    // serde_yaml appends " at line X column Y"; the location is reported separately
    let trimmed = match msg.find(" at line ") {
        Some(idx) => &msg[..idx],
        None => msg,
    };
    (trimmed.to_string(), ParseErrorKind::Syntax)
}

fn between(msg: &str, prefix: &str, suffix: &str) -> Option<String> {
    let start = msg.find(prefix)? + prefix.len();
    let end = msg[start..].find(suffix)? + start;
    Some(msg[start..end].to_string())
}

fn expected_fields(msg: &str) -> Option<Vec<String>> {
    let start = msg.find("expected one of ")? + "expected one of ".len();
    let rest = &msg[start..];
    let end = rest.find(" at line").unwrap_or(rest.len());
    Some(
        rest[..end]
            .split(", ")
            .map(|s| s.trim_matches('`').to_string())
            .collect(),
    )
}

fn suggest_fix(msg: &str, source: &str, line: usize) -> Option<String> {
    let error_line = source
        .lines()
        .nth(line.saturating_sub(1))
        .unwrap_or_default();

    if msg.contains("missing field `steps`") {
        return Some("every stage needs a 'steps:' list".to_string());
    }

    if msg.contains("missing field `stages`") {
        return Some("a pipeline needs at least one entry under 'stages:'".to_string());
    }

    if msg.contains("unknown variant") || msg.contains("no variant") {
        return Some(
            "a step must use one of: script, checkout, build, login, push, update_access_config, upgrade_release"
                .to_string(),
        );
    }

    if error_line.starts_with('\t') {
        return Some("YAML does not allow tabs for indentation; use spaces".to_string());
    }

    let typos = [
        ("branch:", "branches"),
        ("env:", "environment"),
        ("credential:", "credentials"),
        ("workdir:", "working_directory"),
        ("username_var:", "username_variable"),
        ("password_var:", "password_variable"),
    ];

    let lower = error_line.trim_start().to_lowercase();
    for (typo, correct) in typos {
        if lower.starts_with(typo) {
            return Some(format!("did you mean '{}'?", correct));
        }
    }

    None
}

/// Semantic problem found after a definition parsed successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub message: String,
    /// Dotted location inside the definition, e.g. `stages[1].steps[0]`
    pub path: String,
    pub suggestion: Option<String>,
}

impl ValidationError {
    pub fn new(message: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            path: path.into(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " ({})", suggestion)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_location_and_help() {
        let err = ParseError::new("missing required field 'steps'", 4, 5)
            .with_suggestion("every stage needs a 'steps:' list");

        let output = err.to_string();
        assert!(output.contains("missing required field"));
        assert!(output.contains("line 4:5"));
        assert!(output.contains("help:"));
    }

    #[test]
    fn test_io_error_has_no_location() {
        let output = ParseError::io("failed to read pipeline.yaml").to_string();
        assert!(!output.contains("-->"));
    }

    #[test]
    fn test_source_context_marks_line() {
        let source = "name: deploy\nstages:\n  - name: Build\n    stepz: []\n";
        let err = ParseError::new("unknown field 'stepz'", 4, 5).with_source_context(source, 1);

        assert!(err.context.contains(">    4 |     stepz: []"));
        assert!(err.context.contains("    3 |   - name: Build"));
    }

    #[test]
    fn test_describe_unknown_field() {
        let (message, kind) = describe_yaml_error(
            "stages[0]: unknown field `branch`, expected one of `name`, `branches` at line 3 column 5",
        );
        assert_eq!(kind, ParseErrorKind::UnknownField);
        assert!(message.starts_with("unknown field 'branch'"));
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::new("stage name is empty", "stages[0]")
            .with_suggestion("give the stage a name");
        assert_eq!(
            err.to_string(),
            "stages[0]: stage name is empty (give the stage a name)"
        );
    }
}
