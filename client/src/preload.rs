use std::collections::{HashSet, VecDeque};

const ASSET_SCHEME: &str = "asset://";

/// Asset URLs to fetch before the world is shown, each at most once.
#[derive(Debug, Default)]
pub struct PreloadQueue {
    assets_url: String,
    seen: HashSet<String>,
    pending: VecDeque<String>,
}

impl PreloadQueue {
    pub fn new(assets_url: impl Into<String>) -> Self {
        Self {
            assets_url: assets_url.into(),
            ..Default::default()
        }
    }

    pub fn set_assets_url(&mut self, assets_url: impl Into<String>) {
        self.assets_url = assets_url.into();
    }

    /// Turns `asset://name` into `<assetsUrl>/name`; other URLs pass through.
    pub fn resolve(&self, url: &str) -> String {
        match url.strip_prefix(ASSET_SCHEME) {
            Some(name) => format!("{}/{}", self.assets_url.trim_end_matches('/'), name),
            None => url.to_string(),
        }
    }

    /// Queues `url` unless it was queued before.
    pub fn push(&mut self, url: &str) -> bool {
        let resolved = self.resolve(url);
        if !self.seen.insert(resolved.clone()) {
            return false;
        }
        self.pending.push_back(resolved);
        true
    }

    pub fn drain(&mut self) -> Vec<String> {
        self.pending.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
