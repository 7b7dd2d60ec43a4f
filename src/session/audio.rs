//! Streaming-audio encoder state carried across turns.
//!
//! When the audio encoder is a streaming encoder, its rolling internal state
//! must survive across interleaved chunks within and across turns. The
//! session owns one `AudioContext` and offers a create/clone/restore surface,
//! mirroring how `ProcessedContext` is cloned atomically on session clone.

use crate::model::AudioEncoderState;

#[derive(Debug, Clone, Default)]
pub struct AudioContext {
    state: AudioEncoderState,
}

impl AudioContext {
    pub fn create() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &AudioEncoderState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut AudioEncoderState {
        &mut self.state
    }

    /// Deep-copies the rolling encoder state, for session clone.
    pub fn clone_context(&self) -> Self {
        self.clone()
    }

    /// Replaces this context's state wholesale, e.g. after restoring a
    /// previously cloned context.
    pub fn restore(&mut self, from: &AudioContext) {
        self.state = from.state.clone();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn clone_context_is_independent_of_the_original() {
        let mut original = AudioContext::create();
        original.state_mut().history.push(1.0);

        let cloned = original.clone_context();
        original.state_mut().history.push(2.0);

        assert_eq!(cloned.state().history, vec![1.0]);
        assert_eq!(original.state().history, vec![1.0, 2.0]);
    }

    #[test]
    fn restore_overwrites_current_state() {
        let mut a = AudioContext::create();
        a.state_mut().history.push(9.0);
        let mut b = AudioContext::create();
        b.restore(&a);
        assert_eq!(b.state().history, vec![9.0]);
    }
}
