use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::dap::types::{Breakpoint, SetBreakpointsArguments, Source, SourceBreakpoint};

#[derive(Debug, Clone, Default, PartialEq)]
struct SourceBreakpoints {
    requested: BTreeSet<i64>,
    verified: Vec<Breakpoint>,
}

/// Client-side record of line breakpoints, keyed by source path.
///
/// DAP `setBreakpoints` replaces the whole set for a source, so the set for a
/// file is always sent in full and never diffed.
#[derive(Debug, Clone, Default)]
pub struct BreakpointSet {
    sources: BTreeMap<PathBuf, SourceBreakpoints>,
}

impl BreakpointSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the adapter's answer to a `setBreakpoints` request for `path`
    /// and return the verified lines. Only call this once the adapter has
    /// accepted the request; an empty `lines` clears the file.
    pub fn commit(
        &mut self,
        path: &Path,
        lines: BTreeSet<i64>,
        breakpoints: Vec<Breakpoint>,
    ) -> BTreeSet<i64> {
        let verified = verified_lines(&lines, &breakpoints);
        if lines.is_empty() {
            self.sources.remove(path);
        } else {
            self.sources.insert(
                path.to_path_buf(),
                SourceBreakpoints {
                    requested: lines,
                    verified: breakpoints,
                },
            );
        }
        verified
    }

    pub fn requested(&self, path: &Path) -> Option<&BTreeSet<i64>> {
        self.sources.get(path).map(|entry| &entry.requested)
    }

    pub fn verified(&self, path: &Path) -> BTreeSet<i64> {
        self.sources
            .get(path)
            .map(|entry| verified_lines(&entry.requested, &entry.verified))
            .unwrap_or_default()
    }

    pub fn sources(&self) -> impl Iterator<Item = &Path> {
        self.sources.keys().map(PathBuf::as_path)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

pub fn set_breakpoints_arguments(path: &Path, lines: &BTreeSet<i64>) -> SetBreakpointsArguments {
    SetBreakpointsArguments {
        source: Source {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned()),
            path: Some(path.to_string_lossy().into_owned()),
        },
        breakpoints: lines.iter().map(|&line| SourceBreakpoint { line }).collect(),
        source_modified: false,
    }
}

/// Lines the adapter accepted. The adapter answers in request order and may
/// move a breakpoint, so a reported line wins over the requested one at the
/// same index.
pub fn verified_lines(requested: &BTreeSet<i64>, breakpoints: &[Breakpoint]) -> BTreeSet<i64> {
    let mut requested = requested.iter().copied();
    breakpoints
        .iter()
        .filter_map(|bp| {
            let fallback = requested.next();
            if bp.verified {
                bp.line.or(fallback)
            } else {
                None
            }
        })
        .collect()
}
