//! Pipeline label templates.
//!
//! Supported tokens:
//! - `${COUNT}` - the pipeline counter
//! - `${material}` / `${material[:n]}` - revision of the named material, optionally truncated
//! - `${env:VAR}` - a trigger-time or pipeline variable
//!
//! Unknown tokens are left in place.

use crate::material::BuildCause;
use crate::plan::EnvironmentVariables;
use regex::{Captures, Regex};
use std::sync::LazyLock;

/// A `${...}` reference. Also used for build-variable substitution on agents.
pub static TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([^}]*)\}").expect("token pattern is valid"));

pub struct LabelTemplate<'a> {
    template: &'a str,
}

impl<'a> LabelTemplate<'a> {
    pub fn new(template: &'a str) -> Self {
        Self { template }
    }

    pub fn render(
        &self,
        counter: u32,
        cause: &BuildCause,
        variables: &EnvironmentVariables,
    ) -> String {
        let rendered = TOKEN.replace_all(self.template, |caps: &Captures<'_>| {
            resolve(&caps[1], counter, cause, variables).unwrap_or_else(|| caps[0].to_string())
        });
        finish(rendered.into_owned(), counter)
    }
}

fn finish(label: String, counter: u32) -> String {
    if label.trim().is_empty() {
        counter.to_string()
    } else {
        label
    }
}

fn resolve(
    token: &str,
    counter: u32,
    cause: &BuildCause,
    variables: &EnvironmentVariables,
) -> Option<String> {
    let token = token.trim();
    if token.eq_ignore_ascii_case("COUNT") {
        return Some(counter.to_string());
    }

    if let Some(name) = token.strip_prefix("env:") {
        return cause
            .variables
            .value_of(name)
            .or_else(|| variables.value_of(name))
            .map(str::to_string);
    }

    let (material, limit) = match token.split_once("[:") {
        Some((name, tail)) => {
            let limit: usize = tail.strip_suffix(']')?.parse().ok()?;
            (name, Some(limit))
        }
        None => (token, None),
    };

    let value = cause
        .revision_for_material_named(material)?
        .revision
        .label_value();
    Some(match limit {
        Some(n) => value.chars().take(n).collect(),
        None => value,
    })
}
