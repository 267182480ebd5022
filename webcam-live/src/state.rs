use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// State shared by all HTTP connections.
#[derive(Clone, Debug)]
pub struct State(Arc<StateInner>);

impl State {
    pub fn new<P>(workspace: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self(Arc::new(StateInner {
            workspace: workspace.into(),
        }))
    }
}

impl Deref for State {
    type Target = StateInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug)]
pub struct StateInner {
    workspace: PathBuf,
}

impl StateInner {
    /// The directory served under `/stream/`.
    #[inline]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}
