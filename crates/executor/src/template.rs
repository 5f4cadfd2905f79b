//! Minimal `{{.name}}` command templates.

use std::collections::HashMap;

use crate::ExecutorError;

/// Substitutes every `{{.name}}` action in `template` from `values`.
///
/// Only bare field references are supported: `name` is one or more ASCII
/// letters, digits or underscores. Pipelines, nested fields and any other
/// action are parse errors.
pub fn render(template: &str, values: &HashMap<String, String>) -> Result<String, ExecutorError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| ExecutorError::TemplateParse(format!("unclosed action in {template:?}")))?;

        let action = after_open[..close].trim();
        let name = action
            .strip_prefix('.')
            .filter(|name| !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
            .ok_or_else(|| ExecutorError::TemplateParse(format!("unsupported action {{{{{action}}}}}")))?;
        let value = values
            .get(name)
            .ok_or_else(|| ExecutorError::TemplateRender(format!("no value for {name:?}")))?;
        out.push_str(value);

        rest = &after_open[close + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Splits a rendered command line the way a POSIX shell would.
pub fn tokenize(rendered: &str) -> Result<Vec<String>, ExecutorError> {
    shlex::split(rendered).ok_or_else(|| ExecutorError::Quoting(rendered.to_string()))
}
