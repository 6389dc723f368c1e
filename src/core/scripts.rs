use std::fs;
use std::path::Path;

use crate::core::error::{Error, Result};

pub const TUNNEL_BASE: &str = include_str!("../../templates/tunnel_base.sh");
pub const TUNNEL_GET_ONLINE: &str = include_str!("../../templates/tunnel_get_online.sh");

const SCRIPTS: &[(&str, &str)] = &[
    ("reboot.sh", include_str!("../../templates/scripts/reboot.sh")),
    (
        "tunnel_start.sh",
        include_str!("../../templates/scripts/tunnel_start.sh"),
    ),
    ("nop.sh", include_str!("../../templates/scripts/nop.sh")),
];

const QUERIES: &[(&str, &str)] = &[
    (
        "connectivity-issues.query",
        include_str!("../../templates/queries/connectivity-issues.query"),
    ),
    (
        "post-deploy-health.query",
        include_str!("../../templates/queries/post-deploy-health.query"),
    ),
];

pub fn script_names() -> Vec<&'static str> {
    SCRIPTS.iter().map(|(name, _)| *name).collect()
}

/// Resolves a script argument to its body. Embedded names win, anything
/// else is treated as a path on disk.
pub fn script_body(name_or_path: &str) -> Result<String> {
    if let Some((_, body)) = SCRIPTS.iter().find(|(name, _)| *name == name_or_path) {
        return Ok((*body).to_string());
    }
    read_file(name_or_path, "script")
}

pub fn query_body(name_or_path: &str) -> Result<String> {
    if let Some((_, body)) = QUERIES.iter().find(|(name, _)| *name == name_or_path) {
        return Ok((*body).to_string());
    }
    read_file(name_or_path, "query")
}

fn read_file(path: &str, kind: &str) -> Result<String> {
    let path = Path::new(path);
    if !path.is_file() {
        return Err(Error::Config(format!(
            "{} not found: {}",
            kind,
            path.display()
        )));
    }
    Ok(fs::read_to_string(path)?)
}

/// Fills `# {{key}}` marker lines in a shell template. Markers live on
/// their own line so the template stays runnable as-is during edits.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        let marker = format!("# {{{{{}}}}}", key);
        out = out.replace(&marker, value);
    }
    out
}
