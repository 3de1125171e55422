//! Caller-owned session.
//!
//! A host that embeds the framework (a renderer, a camera preview) keeps one
//! [`Session`] per operator and passes it into every call. Nothing is global,
//! so any number of sessions can live side by side.

use std::sync::Arc;

use tracing::trace;

use crate::interop::{InteropTextures, SharedDevice};
use crate::params::Params;
use crate::status::{Reporter, StatusSink};
use crate::tonemap::{Operator, PipelineState, RunOptions, RunReport, ToneMapper};
use crate::{ComputeError, ComputeResult};

pub struct Session {
    params: Params,
    mapper: ToneMapper,
}

impl Session {
    pub fn new(operator: Operator, params: Params, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            params,
            mapper: ToneMapper::with_reporter(operator, Reporter::new(sink)),
        }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn state(&self) -> PipelineState {
        self.mapper.state()
    }

    pub fn mapper(&self) -> &ToneMapper {
        &self.mapper
    }

    pub fn mapper_mut(&mut self) -> &mut ToneMapper {
        &mut self.mapper
    }

    /// Sets up host-buffer processing of `width` x `height` images.
    pub fn init(&mut self, width: u32, height: u32) -> ComputeResult<()> {
        trace!(width, height, "Session::init");
        self.mapper.setup(&self.params, width, height)
    }

    /// Sets up texture processing on the caller's device.
    pub fn init_with_textures(&mut self, shared: SharedDevice, textures: InteropTextures) -> ComputeResult<()> {
        trace!("Session::init_with_textures");
        let params = Params {
            interop: true,
            ..self.params.clone()
        };
        self.mapper.setup_with_textures(&params, shared, textures)
    }

    /// Tone-maps the current input texture into the output texture.
    ///
    /// With `recompute` false the statistics of the previous frame are
    /// reused.
    pub fn process_frame(&mut self, recompute: bool) -> ComputeResult<RunReport> {
        let options = RunOptions {
            recompute_mapping: recompute,
            ..RunOptions::default()
        };
        self.mapper.process_frame(&options)
    }

    pub fn process(&mut self, input: &[u8], output: &mut [u8], options: &RunOptions) -> ComputeResult<RunReport> {
        self.mapper.process(input, output, options)
    }

    /// CPU reference at the size given to [`init`](Self::init).
    pub fn reference(&mut self, input: &[u8], output: &mut [u8]) -> ComputeResult<()> {
        let size = self.mapper.size().ok_or_else(|| {
            self.mapper.reporter().fail(ComputeError::InvalidState {
                op: "run the reference",
                state: self.mapper.state(),
            })
        })?;
        self.mapper.reference(input, output, size)
    }

    pub fn shutdown(&mut self) {
        trace!("Session::shutdown");
        self.mapper.cleanup();
        self.mapper.clear_reference_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Severity;
    use std::sync::Mutex;

    fn collecting() -> (Arc<Mutex<Vec<(Severity, String)>>>, Arc<dyn StatusSink>) {
        let lines = Arc::new(Mutex::new(Vec::new()));
        let sink_lines = Arc::clone(&lines);
        let sink = Arc::new(move |severity: Severity, message: &str| {
            sink_lines.lock().unwrap().push((severity, message.to_string()));
        });
        (lines, sink)
    }

    #[test]
    fn test_reference_needs_init() {
        let (lines, sink) = collecting();
        let mut session = Session::new(Operator::reinhard_global(), Params::default(), sink);
        let input = vec![0u8; 16];
        let mut output = vec![0u8; 16];
        let err = session.reference(&input, &mut output).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Cannot run the reference while pipeline is unconfigured"
        );
        let lines = lines.lock().unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].0, Severity::Error);
    }

    #[test]
    fn test_failed_init_stays_unconfigured() {
        let (_, sink) = collecting();
        let mut session = Session::new(Operator::hist_eq(), Params::default(), sink);
        assert!(session.init(0, 4).is_err());
        assert_eq!(session.state(), PipelineState::Unconfigured);
        assert!(session.process_frame(true).is_err());
    }

    #[test]
    fn test_interop_params_need_textures() {
        let (lines, sink) = collecting();
        let params = Params {
            interop: true,
            ..Params::default()
        };
        let mut session = Session::new(Operator::reinhard_local(), params, sink);
        let err = session.init(16, 16).unwrap_err();
        assert!(matches!(err, ComputeError::Configuration(_)), "{err}");
        assert_eq!(session.state(), PipelineState::Unconfigured);
        assert!(lines.lock().unwrap().iter().any(|(s, _)| *s == Severity::Error));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (_, sink) = collecting();
        let mut session = Session::new(Operator::grad_dom(), Params::default(), sink);
        session.shutdown();
        session.shutdown();
        assert_eq!(session.state(), PipelineState::Unconfigured);
    }

    #[test]
    fn test_sessions_are_independent() {
        let (_, sink) = collecting();
        let a = Session::new(Operator::hist_eq(), Params::default(), Arc::clone(&sink));
        let b = Session::new(Operator::reinhard_local(), Params::default().with_verify(true), sink);
        assert!(!a.params().verify);
        assert!(b.params().verify);
        assert_ne!(a.mapper().operator().algorithm(), b.mapper().operator().algorithm());
    }
}
