//! The service-list file: line-oriented descriptors of internal and
//! external services, reloaded when the file mtime changes. Revisions are
//! preserved across reloads whose value+option are unchanged.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;
use xic::Endpoint;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyKind {
    Internal,
    External,
}

#[derive(Debug, Clone)]
pub struct ProxyDetail {
    pub kind: ProxyKind,
    pub value: String,
    pub option: String,
    pub revision: i64,
}

struct State {
    map: HashMap<String, ProxyDetail>,
    mtime: Option<SystemTime>,
    last_revision: i64,
}

pub struct ProxyConfig {
    listfile: PathBuf,
    state: Mutex<State>,
}

impl ProxyConfig {
    pub fn new(listfile: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let config = Self {
            listfile: listfile.into(),
            state: Mutex::new(State {
                map: HashMap::new(),
                mtime: None,
                last_revision: 0,
            }),
        };
        config.reload()?;
        Ok(config)
    }

    pub fn find(&self, id: &str) -> Option<ProxyDetail> {
        let state = self.state.lock().unwrap();
        let found = state.map.get(id).cloned();
        if found.is_none() {
            tracing::info!(id, file = %self.listfile.display(), "service not in list file");
        }
        found
    }

    /// Re-read the list file if its mtime changed. Returns true when a
    /// reload actually happened.
    pub fn reload(&self) -> anyhow::Result<bool> {
        let mtime = std::fs::metadata(&self.listfile)?.modified()?;
        {
            let state = self.state.lock().unwrap();
            if state.mtime == Some(mtime) {
                return Ok(false);
            }
        }

        let content = std::fs::read_to_string(&self.listfile)?;
        tracing::info!(file = %self.listfile.display(), "loading service list");
        self.load_str(&content);
        self.state.lock().unwrap().mtime = Some(mtime);
        Ok(true)
    }

    /// Parse `content` and swap in the resulting table, carrying forward
    /// revisions of unchanged entries.
    fn load_str(&self, content: &str) {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;
        let mut fresh: HashMap<String, ProxyDetail> = HashMap::new();

        let mut key = String::new();
        let mut kind = ProxyKind::External;
        let mut value = String::new();
        let mut option = String::new();

        macro_rules! flush {
            () => {
                add_item(
                    &mut fresh,
                    &state.map,
                    &mut state.last_revision,
                    &key,
                    kind,
                    &value,
                    &option,
                );
            };
        }

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with('~') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('@') {
                // Additional endpoint of the current item.
                value.push_str(" @");
                value.push_str(rest);
            } else if let Some(rest) = line.strip_prefix('=') {
                // Option appendage, attaching to the preceding endpoint.
                value.push(' ');
                value.push_str(rest);
            } else if let Some(rest) = line.strip_prefix('!') {
                flush!();
                key.clear();
                let Some((k, v)) = rest.split_once('=') else {
                    continue;
                };
                if k.is_empty() {
                    continue;
                }
                key = k.to_string();
                kind = ProxyKind::Internal;
                value = v.to_string();
                option = String::new();
            } else {
                flush!();
                key.clear();
                let Some((head, v)) = line.split_once('@') else {
                    continue;
                };
                let mut tokens = head.split_whitespace();
                let Some(identity) = tokens.next() else {
                    continue;
                };
                key = identity.to_string();
                kind = ProxyKind::External;
                option = tokens.collect::<Vec<_>>().join(" ");
                value = if v.is_empty() {
                    String::new()
                } else {
                    format!("@{v}")
                };
            }
        }
        flush!();

        state.map = fresh;
    }
}

fn add_item(
    fresh: &mut HashMap<String, ProxyDetail>,
    old: &HashMap<String, ProxyDetail>,
    last_revision: &mut i64,
    key: &str,
    kind: ProxyKind,
    value: &str,
    option: &str,
) {
    if key.is_empty() {
        return;
    }
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return;
    }

    let value = match kind {
        ProxyKind::External => normalize_endpoints(key, trimmed),
        ProxyKind::Internal => trimmed.to_string(),
    };

    let revision = match old.get(key) {
        Some(prev) if prev.value == value && prev.option == option => prev.revision,
        _ => {
            *last_revision += 1;
            *last_revision
        }
    };

    fresh.insert(
        key.to_string(),
        ProxyDetail {
            kind,
            value,
            option: option.to_string(),
            revision,
        },
    );
}

/// Re-render the `@`-separated endpoint list in canonical form, dropping
/// endpoints that fail to parse.
fn normalize_endpoints(key: &str, value: &str) -> String {
    let mut out = String::new();
    for token in value.split('@') {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        match Endpoint::parse(token) {
            Ok(ep) => {
                out.push('@');
                out.push_str(&ep.to_string());
            }
            Err(err) => {
                tracing::error!(endpoint = token, service = key, %err, "invalid endpoint");
            }
        }
    }
    out
}

/// Split the endpoint list of an external descriptor value.
pub fn endpoints_of(value: &str) -> Vec<Endpoint> {
    value
        .split('@')
        .filter_map(|token| {
            let token = token.trim();
            (!token.is_empty()).then(|| Endpoint::parse(token).ok())?
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LIST: &str = "\
# front services
!MCache=h1+11211 h2+11211 h3+11211
!Redis~sessions=secret^r1+6379 r2+6379

demo.Account timeout=60000@tcp+10.0.0.1+3300
@tcp+10.0.0.2+3300
=timeout=7000,0,2000

demo.Search@tcp+search.internal+9900
";

    fn write_list(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn parses_internal_and_external_items() {
        let file = write_list(LIST);
        let config = ProxyConfig::new(file.path()).unwrap();

        let mcache = config.find("MCache").unwrap();
        assert_eq!(mcache.kind, ProxyKind::Internal);
        assert_eq!(mcache.value, "h1+11211 h2+11211 h3+11211");

        let redis = config.find("Redis~sessions").unwrap();
        assert_eq!(redis.kind, ProxyKind::Internal);
        assert!(redis.value.starts_with("secret^"));

        let account = config.find("demo.Account").unwrap();
        assert_eq!(account.kind, ProxyKind::External);
        assert_eq!(account.option, "timeout=60000");
        assert_eq!(
            account.value,
            "@tcp+10.0.0.1+3300@tcp+10.0.0.2+3300 timeout=7000,0,2000"
        );
        let eps = endpoints_of(&account.value);
        assert_eq!(eps.len(), 2);
        assert_eq!(eps[1].connect_timeout_msec, 2000);

        assert!(config.find("absent").is_none());
    }

    #[test]
    fn unchanged_items_keep_their_revision() {
        let file = write_list(LIST);
        let config = ProxyConfig::new(file.path()).unwrap();
        let before = config.find("demo.Account").unwrap().revision;
        let mcache_before = config.find("MCache").unwrap().revision;

        // Same content: all revisions stay put.
        config.load_str(LIST);
        assert_eq!(config.find("demo.Account").unwrap().revision, before);
        assert_eq!(config.find("MCache").unwrap().revision, mcache_before);

        // A changed value gets a strictly greater revision.
        let changed = LIST.replace("h3+11211", "h4+11211");
        config.load_str(&changed);
        let mcache_after = config.find("MCache").unwrap().revision;
        assert!(mcache_after > mcache_before);
        assert_eq!(config.find("demo.Account").unwrap().revision, before);

        // A dropped entry disappears.
        config.load_str("!MCache=h1+11211\n");
        assert!(config.find("demo.Account").is_none());
    }
}
