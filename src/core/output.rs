use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::core::error::Result;
use crate::core::interface::ExecutionResult;
use crate::log_status;

const HEADER: &str = "device_id,return_code,success,stdout,stderr";

/// Append execution results to a CSV file, writing the header only when
/// the file is created. Appending keeps resumed campaigns in one file.
pub fn append_results(path: &Path, results: &[ExecutionResult]) -> Result<()> {
    if results.is_empty() {
        return Ok(());
    }
    let existed = path.is_file();
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existed {
        writeln!(file, "{HEADER}")?;
    }
    for result in results {
        writeln!(
            file,
            "{},{},{},{},{}",
            csv_escape(&result.device_id),
            result
                .return_code
                .map(|rc| rc.to_string())
                .unwrap_or_default(),
            result.success,
            csv_escape(result.stdout.as_deref().unwrap_or("")),
            csv_escape(result.stderr.as_deref().unwrap_or("")),
        )?;
    }
    log_status!(
        "output",
        "{} {} result(s) to {}",
        if existed { "appended" } else { "wrote" },
        results.len(),
        path.display()
    );
    Ok(())
}

/// `results.csv` + `predeploy` -> `results.predeploy.csv`.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    match (path.file_stem(), path.extension()) {
        (Some(stem), Some(ext)) => path.with_file_name(format!(
            "{}.{}.{}",
            stem.to_string_lossy(),
            suffix,
            ext.to_string_lossy()
        )),
        _ => path.with_file_name(format!(
            "{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            suffix
        )),
    }
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn result(id: &str, stdout: &str) -> ExecutionResult {
        ExecutionResult {
            device_id: id.to_string(),
            return_code: Some(0),
            success: true,
            stdout: Some(stdout.to_string()),
            stderr: None,
        }
    }

    #[test]
    fn header_is_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        append_results(&path, &[result("aaaaaaaaaaa1", "ok")]).unwrap();
        append_results(&path, &[result("aaaaaaaaaaa2", "ok")]).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert!(lines[1].starts_with("aaaaaaaaaaa1,0,true,"));
        assert!(lines[2].starts_with("aaaaaaaaaaa2,0,true,"));
    }

    #[test]
    fn missing_return_code_stays_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.csv");
        append_results(&path, &[ExecutionResult::unreachable("aaaaaaaaaaa1", "gone".into())])
            .unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.lines().nth(1).unwrap().starts_with("aaaaaaaaaaa1,,false,"));
    }

    #[test]
    fn fields_with_separators_are_quoted() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn suffix_lands_before_the_extension() {
        assert_eq!(
            with_suffix(Path::new("out/results.csv"), "predeploy"),
            PathBuf::from("out/results.predeploy.csv")
        );
        assert_eq!(
            with_suffix(Path::new("results"), "wave2"),
            PathBuf::from("results.wave2")
        );
    }
}
