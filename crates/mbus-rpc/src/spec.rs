//! Import/export name mapping of a stub.
//!
//! A spec lists which local APIs a server exports (optionally under
//! another remote name) and which remote APIs a client imports
//! (optionally as another local name). Entries are comma-separated,
//! `name` or `local=remote`.

use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    local: String,
    remote: String,
}

/// Shared, immutable import/export tables.
#[derive(Debug, Default)]
pub struct RpcSpec {
    imports: Vec<Mapping>,
    exports: Vec<Mapping>,
}

fn parse_list(list: &str) -> Vec<Mapping> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((local, remote)) => Mapping {
                local: local.to_string(),
                remote: remote.to_string(),
            },
            None => Mapping {
                local: entry.to_string(),
                remote: entry.to_string(),
            },
        })
        .collect()
}

impl RpcSpec {
    /// Build from the two comma-separated lists.
    pub fn make(imports: &str, exports: &str) -> Arc<RpcSpec> {
        Arc::new(RpcSpec {
            imports: parse_list(imports),
            exports: parse_list(exports),
        })
    }

    /// Spec for a single api: imported by clients, exported by servers.
    pub fn for_api(api: &str, client: bool) -> Arc<RpcSpec> {
        if client {
            RpcSpec::make(api, "")
        } else {
            RpcSpec::make("", api)
        }
    }

    /// Names a client imports (local names).
    pub fn imported_locals(&self) -> Vec<&str> {
        self.imports.iter().map(|m| m.local.as_str()).collect()
    }

    /// Remote name to use when a client calls the local name `api`.
    pub fn remote_of_import(&self, api: &str) -> Option<&str> {
        self.imports
            .iter()
            .find(|m| m.local == api)
            .map(|m| m.remote.as_str())
    }

    /// Local name of an exported api asked by a peer under `remote`;
    /// `None` when the name is not exported. An empty export table
    /// exports nothing — servers must name their surface.
    pub fn local_of_export(&self, remote: &str) -> Option<&str> {
        self.exports
            .iter()
            .find(|m| m.remote == remote)
            .map(|m| m.local.as_str())
    }

    pub fn has_exports(&self) -> bool {
        !self.exports.is_empty()
    }

    /// Walk one side of the tables.
    pub fn for_each<F: FnMut(&str, &str)>(&self, client: bool, mut callback: F) {
        let side = if client { &self.imports } else { &self.exports };
        for m in side {
            callback(&m.local, &m.remote);
        }
    }

    /// Compact textual form, mostly for logs.
    pub fn dump(&self) -> String {
        let join = |side: &[Mapping]| {
            side.iter()
                .map(|m| {
                    if m.local == m.remote {
                        m.local.clone()
                    } else {
                        format!("{}={}", m.local, m.remote)
                    }
                })
                .collect::<Vec<_>>()
                .join(",")
        };
        format!("import:{} export:{}", join(&self.imports), join(&self.exports))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_renames_and_plain_names() {
        let spec = RpcSpec::make("hello,loc=rem", "pub=priv");
        assert_eq!(spec.remote_of_import("hello"), Some("hello"));
        assert_eq!(spec.remote_of_import("loc"), Some("rem"));
        assert_eq!(spec.remote_of_import("nope"), None);
        assert_eq!(spec.local_of_export("pub"), Some("priv"));
        assert_eq!(spec.local_of_export("priv"), None);
    }

    #[test]
    fn for_api_splits_by_side() {
        let client = RpcSpec::for_api("gps", true);
        assert_eq!(client.imported_locals(), vec!["gps"]);
        assert!(!client.has_exports());

        let server = RpcSpec::for_api("gps", false);
        assert_eq!(server.local_of_export("gps"), Some("gps"));
        assert!(server.imported_locals().is_empty());
    }

    #[test]
    fn dump_is_stable() {
        let spec = RpcSpec::make("a,b=c", "d");
        assert_eq!(spec.dump(), "import:a,b=c export:d");
    }
}
