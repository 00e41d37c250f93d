use serde::Serialize;

/// Lifecycle of a generation pipeline
///
/// `Generating` is only ever observed while a regeneration is in progress.
/// A failed regeneration falls back to whatever state preceded it, so the
/// last ready buffers stay drawable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
pub enum GenerationState {
    #[default]
    Uninitialized,
    Generating,
    Ready,
}

impl GenerationState {
    pub fn is_ready(self) -> bool {
        self == GenerationState::Ready
    }
}
