use std::fs;
use std::path::{Path, PathBuf};

use crate::core::compute;
use crate::core::device;
use crate::core::error::{Error, Result};
use crate::core::interface::InterfaceFactory;
use crate::core::progress::Progress;
use crate::core::registry;
use crate::core::scripts;
use crate::core::search::{self, SearchClient, TimeWindow};
use crate::log_status;
use std::sync::Arc;

/// Reserved targeting keyword: every registry device without a live
/// tunnel.
pub const UNREACHABLE_KEYWORD: &str = "targeting:unreachable";

/// Guard rails applied to every resolved target set.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub devices_limit: usize,
    pub truncate: bool,
    pub force: bool,
}

/// Enforce the device limit on a resolved target set. Truncation runs
/// first and keeps the input order, so "first N of the file" means what
/// it says.
pub fn apply_limit(mut ids: Vec<String>, options: &ResolveOptions) -> Result<Vec<String>> {
    if options.truncate && ids.len() > options.devices_limit {
        log_status!(
            "targeting",
            "truncating {} device(s) to the first {}",
            ids.len(),
            options.devices_limit
        );
        ids.truncate(options.devices_limit);
    }
    if ids.is_empty() {
        return Err(Error::Targeting("targeting resolved to no devices".into()));
    }
    if ids.len() > options.devices_limit {
        if options.force {
            log_status!(
                "targeting",
                "proceeding with {} device(s), over the limit of {}",
                ids.len(),
                options.devices_limit
            );
        } else {
            return Err(Error::Targeting(format!(
                "{} device(s) exceed the limit of {}; pass --force or --truncate",
                ids.len(),
                options.devices_limit
            )));
        }
    }
    Ok(ids)
}

/// Read device ids from a CSV record file. The id column is picked from
/// the header by the recognized field names.
pub fn load_record_file(path: &Path) -> Result<Vec<String>> {
    let body = fs::read_to_string(path)?;
    let mut lines = body.lines().filter(|l| !l.trim().is_empty());
    let header = lines
        .next()
        .ok_or_else(|| Error::Parse(format!("{} is empty", path.display())))?;
    let fields = split_csv_line(header);
    let id_field = device::select_id_field(&fields).ok_or_else(|| {
        Error::Parse(format!("{} has no device-id column", path.display()))
    })?;
    let column = fields.iter().position(|f| f == id_field).unwrap_or(0);

    let raw: Vec<String> = lines
        .map(split_csv_line)
        .filter_map(|mut record| {
            if column < record.len() {
                Some(record.swap_remove(column))
            } else {
                None
            }
        })
        .collect();
    device::normalize_unique(raw)
}

fn split_csv_line(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if in_quotes => {
                if chars.peek() == Some(&'"') {
                    field.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            }
            '"' => in_quotes = true,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            c => field.push(c),
        }
    }
    fields.push(field);
    fields
}

/// Query results intersected with the registry when one is available.
pub fn fetch_query_ids(
    search: &SearchClient,
    registry: Option<&[String]>,
    query: &str,
    window: TimeWindow,
) -> Result<Vec<String>> {
    let ids = search.fetch_device_ids(query, window)?;
    let Some(registry) = registry else {
        return Ok(ids);
    };
    let selected = device::registry_select(registry, &ids);
    log_status!(
        "targeting",
        "query matched {} device(s), {} ({:.1}%) present in the registry",
        ids.len(),
        selected.len(),
        compute::perc(selected.len(), ids.len().max(1))
    );
    Ok(selected)
}

/// Registry devices without a live tunnel, in registry order.
pub fn fetch_unreachable(
    registry: &[String],
    factory: &dyn InterfaceFactory,
) -> Result<Vec<String>> {
    let progress = Arc::new(Progress::new(registry.len()));
    let mut interface = factory.create(registry.to_vec(), progress);
    interface.open()?;
    let online = interface.get_online();
    interface.close();
    let online = online?;

    let unreachable: Vec<String> = registry
        .iter()
        .filter(|id| !online.contains(id))
        .cloned()
        .collect();
    log_status!(
        "targeting",
        "{} of {} registry device(s) unreachable",
        unreachable.len(),
        registry.len()
    );
    Ok(unreachable)
}

/// Turns a targeting argument into a target set: a CSV record file, a
/// search query (embedded name or path), or a reserved keyword.
pub struct Resolver {
    pub search_config_path: Option<PathBuf>,
    pub registry_bucket: Option<String>,
    pub env: String,
    pub tunnel_factory: Option<Arc<dyn InterfaceFactory>>,
    pub options: ResolveOptions,
}

impl Resolver {
    pub fn resolve(&self, spec: &str, window: Option<TimeWindow>) -> Result<Vec<String>> {
        let ids = if spec == UNREACHABLE_KEYWORD {
            let registry = self.load_registry()?.ok_or_else(|| {
                Error::Config("unreachable targeting needs --registry-bucket".into())
            })?;
            let factory = self.tunnel_factory.as_deref().ok_or_else(|| {
                Error::Config("unreachable targeting needs the tunnel interface".into())
            })?;
            fetch_unreachable(&registry, factory)?
        } else if spec.ends_with(".csv") {
            load_record_file(Path::new(spec))?
        } else {
            let query = scripts::query_body(spec)?;
            let window = window.ok_or_else(|| {
                Error::Config("query targeting needs a time window".into())
            })?;
            let config = search::load_config(self.search_config_path.as_deref())?;
            let registry = self.load_registry()?;
            fetch_query_ids(&SearchClient::new(config), registry.as_deref(), &query, window)?
        };
        apply_limit(ids, &self.options)
    }

    fn load_registry(&self) -> Result<Option<Vec<String>>> {
        match &self.registry_bucket {
            Some(bucket) => Ok(Some(registry::load_latest(bucket, &self.env)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn options(limit: usize) -> ResolveOptions {
        ResolveOptions {
            devices_limit: limit,
            truncate: false,
            force: false,
        }
    }

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("aaaaaaaaa{i:03}")).collect()
    }

    #[test]
    fn limit_passes_small_sets_through() {
        let set = ids(3);
        assert_eq!(apply_limit(set.clone(), &options(5)).unwrap(), set);
    }

    #[test]
    fn over_limit_without_force_is_fatal() {
        let err = apply_limit(ids(6), &options(5)).unwrap_err();
        assert_eq!(err.code(), "TARGETING_ERROR");
    }

    #[test]
    fn force_overrides_the_limit() {
        let mut opts = options(5);
        opts.force = true;
        assert_eq!(apply_limit(ids(6), &opts).unwrap().len(), 6);
    }

    #[test]
    fn truncate_keeps_the_first_n_in_order() {
        let mut opts = options(3);
        opts.truncate = true;
        let out = apply_limit(ids(6), &opts).unwrap();
        assert_eq!(out, ids(6)[..3].to_vec());
    }

    #[test]
    fn empty_target_set_is_fatal() {
        let err = apply_limit(Vec::new(), &options(5)).unwrap_err();
        assert_eq!(err.code(), "TARGETING_ERROR");
    }

    #[test]
    fn record_file_picks_the_id_column() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.csv");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "site,MAC,note").unwrap();
        writeln!(file, "denver,AAAAAAAAAAA1,\"ok, fine\"").unwrap();
        writeln!(file, "boise,aaaaaaaaaaa2,").unwrap();
        writeln!(file, "reno,aaaaaaaaaaa1,dup").unwrap();

        let ids = load_record_file(&path).unwrap();
        assert_eq!(ids, vec!["aaaaaaaaaaa1", "aaaaaaaaaaa2"]);
    }

    #[test]
    fn record_file_without_id_column_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("targets.csv");
        fs::write(&path, "site,note\ndenver,ok\n").unwrap();
        let err = load_record_file(&path).unwrap_err();
        assert_eq!(err.code(), "PARSE_ERROR");
    }

    #[test]
    fn csv_quotes_escape_commas() {
        assert_eq!(
            split_csv_line("a,\"b, c\",\"d\"\"e\""),
            vec!["a", "b, c", "d\"e"]
        );
    }
}
