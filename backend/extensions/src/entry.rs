//! Extension entry points.
//!
//! Every loaded module is reduced to one shape, [`InitFn`], before the
//! coordinator sees it. Legacy shapes are adapted here and nowhere else.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::context::ExtensionContext;
use crate::loader::BundleInfo;

/// The canonical extension entry point.
///
/// `Ok(true)` commits everything registered on the context, `Ok(false)`
/// disables the extension deliberately, and `Err` disables it as failed.
#[async_trait]
pub trait Extension: Send + Sync {
    async fn init(&self, ctx: &mut ExtensionContext) -> Result<bool>;
}

/// Normalized init function held by an `ExtensionDescriptor`.
pub type InitFn = Arc<dyn Extension>;

pub type BareInit = Arc<dyn Fn(&mut ExtensionContext) -> Result<()> + Send + Sync>;
pub type DefaultInit = Arc<dyn Fn(&mut ExtensionContext) -> bool + Send + Sync>;

/// Shapes an entry module may take.
#[derive(Clone)]
pub enum EntryPoint {
    /// Implements [`Extension`] directly.
    Module(Arc<dyn Extension>),
    /// A bare function; success means "enabled".
    Bare(BareInit),
    /// Legacy object exposing a `default` function that returns `bool`.
    Default { default: DefaultInit },
}

impl EntryPoint {
    pub fn module(extension: impl Extension + 'static) -> Self {
        EntryPoint::Module(Arc::new(extension))
    }

    pub fn bare<F>(init: F) -> Self
    where
        F: Fn(&mut ExtensionContext) -> Result<()> + Send + Sync + 'static,
    {
        EntryPoint::Bare(Arc::new(init))
    }

    pub fn legacy_default<F>(default: F) -> Self
    where
        F: Fn(&mut ExtensionContext) -> bool + Send + Sync + 'static,
    {
        EntryPoint::Default {
            default: Arc::new(default),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            EntryPoint::Module(_) => "module",
            EntryPoint::Bare(_) => "bare",
            EntryPoint::Default { .. } => "default",
        }
    }
}

impl fmt::Debug for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntryPoint::{}", self.shape())
    }
}

/// Reduce any entry shape to the canonical init function.
pub fn normalize(entry: EntryPoint) -> InitFn {
    match entry {
        EntryPoint::Module(module) => module,
        EntryPoint::Bare(init) => Arc::new(BareShim(init)),
        EntryPoint::Default { default } => Arc::new(DefaultShim(default)),
    }
}

struct BareShim(BareInit);

#[async_trait]
impl Extension for BareShim {
    async fn init(&self, ctx: &mut ExtensionContext) -> Result<bool> {
        (self.0)(ctx).map(|()| true)
    }
}

struct DefaultShim(DefaultInit);

#[async_trait]
impl Extension for DefaultShim {
    async fn init(&self, ctx: &mut ExtensionContext) -> Result<bool> {
        Ok((self.0)(ctx))
    }
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

/// Resolves a discovered bundle to its entry point, if it has one.
pub trait EntryResolver: Send + Sync {
    fn resolve(&self, bundle: &BundleInfo) -> Option<EntryPoint>;
}

/// Entry points compiled into the host, keyed by `<directory>/<main>`, bundle id or directory name.
#[derive(Clone, Default)]
pub struct EntryCatalog {
    entries: HashMap<String, EntryPoint>,
}

impl EntryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, entry: EntryPoint) -> &mut Self {
        self.entries.insert(key.into(), entry);
        self
    }

    pub fn with(mut self, key: impl Into<String>, entry: EntryPoint) -> Self {
        self.insert(key, entry);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl EntryResolver for EntryCatalog {
    fn resolve(&self, bundle: &BundleInfo) -> Option<EntryPoint> {
        let qualified = format!("{}/{}", bundle.dir_name, bundle.main());
        let entry = [qualified.as_str(), bundle.id.as_str(), bundle.dir_name.as_str()]
            .into_iter()
            .find_map(|key| self.entries.get(key).cloned());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::detached_context;
    use crate::capabilities::UiHook;

    struct Toolbar;

    #[async_trait]
    impl Extension for Toolbar {
        async fn init(&self, ctx: &mut ExtensionContext) -> Result<bool> {
            ctx.register_ui_hook(UiHook {
                surface: "toolbar".into(),
                hook_id: "refresh".into(),
                props: serde_json::Value::Null,
            }, 0)?;
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_all_shapes_normalize_to_init() {
        let module = normalize(EntryPoint::module(Toolbar));
        let bare = normalize(EntryPoint::bare(|_ctx| Ok(())));
        let failing = normalize(EntryPoint::bare(|_ctx| anyhow::bail!("no game found")));
        let legacy_off = normalize(EntryPoint::legacy_default(|_ctx| false));

        let mut ctx = detached_context("shapes");
        assert!(module.init(&mut ctx).await.unwrap());
        assert!(bare.init(&mut ctx).await.unwrap());
        assert!(failing.init(&mut ctx).await.is_err());
        assert!(!legacy_off.init(&mut ctx).await.unwrap());
    }

    #[test]
    fn test_shape_names() {
        assert_eq!(EntryPoint::bare(|_ctx| Ok(())).shape(), "bare");
        assert_eq!(format!("{:?}", EntryPoint::legacy_default(|_ctx| true)), "EntryPoint::default");
    }
}
