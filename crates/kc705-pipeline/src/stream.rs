//! Bounded streaming links and the synchronous stage scheduler.
//!
//! Every pair of adjacent stages is joined by a [`Channel`]. A producer may
//! hand off a token only when the channel has room (`try_push`), and a
//! consumer takes tokens only when one is present (`try_pop`). Those two
//! calls are the only suspension points in the pipeline.
//!
//! ```text
//!   feed ─▶ [link 0] ─▶ stage 0 ─▶ [link 1] ─▶ stage 1 ─▶ ... ─▶ [link n] ─▶ drain
//! ```
//!
//! [`Pipeline::step`] visits stages downstream-first so that space freed at
//! the tail propagates toward the head within one step.

use crate::error::{PipelineError, Result};
use crate::frame::{FeatureMap, Layout, Port, Position, Token};
use crate::fixed::Sample;
use std::collections::VecDeque;
use tracing::{debug, trace};

// ── Channel ──────────────────────────────────────────────────────────────────

/// Rejected push; the item is handed back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError<T> {
    /// The channel is at capacity.
    Full(T),
    /// The channel was closed.
    Closed(T),
}

impl<T> PushError<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }
}

/// Bounded FIFO with close semantics.
///
/// Closing stops further pushes but lets the consumer drain whatever remains.
#[derive(Debug)]
pub struct Channel<T> {
    queue: VecDeque<T>,
    capacity: usize,
    closed: bool,
}

impl<T> Channel<T> {
    /// Create an open channel holding at most `capacity` items (minimum one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    /// Hand an item to the consumer if there is room.
    ///
    /// # Errors
    ///
    /// Returns the item inside [`PushError`] when the channel is full or closed.
    pub fn try_push(&mut self, item: T) -> std::result::Result<(), PushError<T>> {
        if self.closed {
            return Err(PushError::Closed(item));
        }
        if self.queue.len() >= self.capacity {
            return Err(PushError::Full(item));
        }
        self.queue.push_back(item);
        Ok(())
    }

    /// Take the oldest item, if any.
    pub fn try_pop(&mut self) -> Option<T> {
        self.queue.pop_front()
    }

    /// Mark the end of the stream.
    pub fn close(&mut self) {
        self.closed = true;
    }

    /// True once [`close`](Self::close) has been called.
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// True when closed and empty: the consumer has seen end-of-stream.
    pub fn is_drained(&self) -> bool {
        self.closed && self.queue.is_empty()
    }

    /// Items waiting.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True if a push would be rejected for lack of room.
    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Maximum items held.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Discard contents and reopen.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.closed = false;
    }
}

// ── Stages ───────────────────────────────────────────────────────────────────

/// Output buffer handed to a stage while it processes one input sample.
///
/// Marks the final sample of each output frame automatically.
#[derive(Debug)]
pub struct Outbox {
    queue: VecDeque<Token>,
    volume: usize,
    produced: usize,
    overrun: bool,
}

impl Outbox {
    /// An empty outbox for output frames of `volume` samples.
    pub fn new(volume: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            volume,
            produced: 0,
            overrun: false,
        }
    }

    /// Emit the next output sample.
    pub fn emit(&mut self, sample: Sample) {
        if self.produced >= self.volume {
            self.overrun = true;
            return;
        }
        self.produced += 1;
        self.queue.push_back(Token {
            sample,
            last: self.produced == self.volume,
        });
    }

    /// Samples emitted so far in the current output frame.
    pub const fn produced(&self) -> usize {
        self.produced
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.produced = 0;
        self.overrun = false;
    }
}

/// One streaming compute element.
///
/// A stage sees each input sample exactly once, in its input port's order,
/// together with the sample's coordinate. By the time it has accepted the
/// final sample of a frame it must have emitted exactly one output frame.
pub trait Stage: Send + std::fmt::Debug {
    /// Name used in diagnostics.
    fn name(&self) -> &str;

    /// Shape and order the stage consumes.
    fn input(&self) -> Port;

    /// Shape and order the stage produces.
    fn output(&self) -> Port;

    /// Process one input sample.
    ///
    /// # Errors
    ///
    /// Structural failures (buffer exhaustion, marker violations) abort the
    /// current frame.
    fn accept(&mut self, token: Token, at: Position, out: &mut Outbox) -> Result<()>;

    /// Discard all per-frame state.
    fn reset(&mut self);
}

/// Wraps a stage with its outbox and frame bookkeeping.
#[derive(Debug)]
pub struct StageRunner {
    stage: Box<dyn Stage>,
    outbox: Outbox,
    input_index: usize,
}

impl StageRunner {
    /// Wrap a stage.
    pub fn new(stage: Box<dyn Stage>) -> Self {
        let volume = stage.output().shape.volume();
        Self {
            stage,
            outbox: Outbox::new(volume),
            input_index: 0,
        }
    }

    /// The wrapped stage.
    pub fn stage(&self) -> &dyn Stage {
        self.stage.as_ref()
    }

    /// Advance by at most one input sample.
    ///
    /// Pending outputs are flushed first; a new input is only consumed once
    /// the outbox is empty. Returns whether anything moved.
    ///
    /// # Errors
    ///
    /// Propagates stage errors and reports frame marker violations.
    pub fn step(&mut self, input: &mut Channel<Token>, output: &mut Channel<Token>) -> Result<bool> {
        let mut progress = self.flush(output);

        if self.outbox.queue.is_empty() {
            if let Some(token) = input.try_pop() {
                self.consume(token)?;
                progress = true;
                progress |= self.flush(output);
            }
        }

        if input.is_drained() && self.outbox.queue.is_empty() && !output.is_closed() {
            output.close();
            progress = true;
        }
        Ok(progress)
    }

    fn consume(&mut self, token: Token) -> Result<()> {
        let port = self.stage.input();
        let volume = port.shape.volume();
        let expected_last = self.input_index + 1 == volume;
        if expected_last && !token.last {
            // The frame runs past the stage's input buffer.
            return Err(PipelineError::resource_exhaustion(self.stage.name(), volume));
        }
        if token.last != expected_last {
            return Err(PipelineError::frame_marker(
                self.stage.name(),
                format!("marker on input sample {} of {volume}", self.input_index),
            ));
        }

        let at = port.layout.position(port.shape, self.input_index);
        self.stage.accept(token, at, &mut self.outbox)?;

        if self.outbox.overrun {
            return Err(PipelineError::frame_marker(
                self.stage.name(),
                "emitted more samples than one output frame",
            ));
        }

        if token.last {
            if self.outbox.produced != self.outbox.volume {
                return Err(PipelineError::frame_marker(
                    self.stage.name(),
                    format!(
                        "emitted {} of {} samples by end of input frame",
                        self.outbox.produced, self.outbox.volume
                    ),
                ));
            }
            self.outbox.produced = 0;
            self.input_index = 0;
        } else {
            self.input_index += 1;
        }
        Ok(())
    }

    fn flush(&mut self, output: &mut Channel<Token>) -> bool {
        let mut moved = false;
        while let Some(token) = self.outbox.queue.pop_front() {
            match output.try_push(token) {
                Ok(()) => moved = true,
                Err(rejected) => {
                    self.outbox.queue.push_front(rejected.into_inner());
                    break;
                }
            }
        }
        moved
    }

    /// Discard stage state and pending output.
    pub fn reset(&mut self) {
        self.stage.reset();
        self.outbox.clear();
        self.input_index = 0;
    }

    fn is_idle(&self) -> bool {
        self.outbox.queue.is_empty() && self.input_index == 0
    }
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

/// A linear chain of stages joined by bounded channels.
#[derive(Debug)]
pub struct Pipeline {
    runners: Vec<StageRunner>,
    links: Vec<Channel<Token>>,
}

impl Pipeline {
    /// Chain stages, every link holding at most `link_capacity` tokens.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the chain is empty or a stage's input
    /// port does not accept its predecessor's output.
    pub fn new(stages: Vec<Box<dyn Stage>>, link_capacity: usize) -> Result<Self> {
        Self::with_link_capacities(stages, |_| link_capacity)
    }

    /// Chain stages with a per-link capacity; link `i` feeds stage `i`.
    ///
    /// # Errors
    ///
    /// As [`Pipeline::new`].
    pub fn with_link_capacities(
        stages: Vec<Box<dyn Stage>>,
        mut capacity: impl FnMut(usize) -> usize,
    ) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::configuration("pipeline has no stages"));
        }
        for pair in stages.windows(2) {
            let (up, down) = (&pair[0], &pair[1]);
            if !down.input().accepts(&up.output()) {
                return Err(PipelineError::configuration(format!(
                    "{} produces {} {:?} but {} expects {} {:?}",
                    up.name(),
                    up.output().shape,
                    up.output().layout,
                    down.name(),
                    down.input().shape,
                    down.input().layout,
                )));
            }
        }
        let links = (0..=stages.len()).map(|i| Channel::new(capacity(i))).collect();
        debug!(stages = stages.len(), "pipeline assembled");
        Ok(Self {
            runners: stages.into_iter().map(StageRunner::new).collect(),
            links,
        })
    }

    /// Port of the first stage.
    pub fn input(&self) -> Port {
        self.runners[0].stage().input()
    }

    /// Port of the last stage.
    pub fn output(&self) -> Port {
        self.runners[self.runners.len() - 1].stage().output()
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.runners.len()
    }

    /// Always false; pipelines have at least one stage.
    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Stage names, head first.
    pub fn stage_names(&self) -> Vec<String> {
        self.runners.iter().map(|r| r.stage().name().to_owned()).collect()
    }

    /// Offer one token to the head of the pipeline.
    ///
    /// # Errors
    ///
    /// Returns the token when the input link is full or closed.
    pub fn try_feed(&mut self, token: Token) -> std::result::Result<(), PushError<Token>> {
        self.links[0].try_push(token)
    }

    /// Take one token from the tail of the pipeline.
    pub fn try_drain(&mut self) -> Option<Token> {
        self.links[self.runners.len()].try_pop()
    }

    /// Signal that no further input will arrive.
    pub fn close_input(&mut self) {
        self.links[0].close();
    }

    /// True once input was closed and every token has been drained.
    pub fn is_finished(&self) -> bool {
        self.links[self.runners.len()].is_drained()
    }

    /// Visit every stage once, tail first.
    ///
    /// # Errors
    ///
    /// Propagates the first stage error.
    pub fn step(&mut self) -> Result<bool> {
        let mut progress = false;
        for i in (0..self.runners.len()).rev() {
            let (upstream, downstream) = self.links.split_at_mut(i + 1);
            progress |= self.runners[i].step(&mut upstream[i], &mut downstream[0])?;
        }
        Ok(progress)
    }

    /// True if no tokens are buffered anywhere.
    pub fn is_quiescent(&self) -> bool {
        self.links.iter().all(Channel::is_empty) && self.runners.iter().all(StageRunner::is_idle)
    }

    /// Stream one frame through the pipeline and collect the output frame.
    ///
    /// # Errors
    ///
    /// Propagates stage errors, and reports a stall if the pipeline stops
    /// moving before the output frame is complete.
    pub fn run_frame(&mut self, frame: &FeatureMap) -> Result<FeatureMap> {
        let input = self.input();
        if frame.shape() != input.shape {
            return Err(PipelineError::configuration(format!(
                "pipeline expects {} but frame is {}",
                input.shape,
                frame.shape()
            )));
        }
        let output = self.output();
        let mut pending = frame.tokens(input.layout).peekable();
        let mut collected = Vec::with_capacity(output.shape.volume());

        loop {
            let mut progress = false;
            while let Some(token) = pending.peek().copied() {
                if self.try_feed(token).is_err() {
                    break;
                }
                pending.next();
                progress = true;
            }
            progress |= self.step()?;
            while let Some(token) = self.try_drain() {
                progress = true;
                collected.push(token);
                if token.last {
                    trace!(samples = collected.len(), "frame complete");
                    return FeatureMap::from_tokens(output.shape, output.layout, collected);
                }
            }
            if !progress {
                return Err(PipelineError::invalid_state(format!(
                    "pipeline stalled after {} output samples",
                    collected.len()
                )));
            }
        }
    }

    /// Discard every buffered token and all stage state.
    pub fn reset(&mut self) {
        for link in &mut self.links {
            link.clear();
        }
        for runner in &mut self.runners {
            runner.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameShape;

    /// Adds a constant to every sample.
    #[derive(Debug)]
    struct Offset {
        port: Port,
        delta: i32,
    }

    impl Stage for Offset {
        fn name(&self) -> &str {
            "offset"
        }
        fn input(&self) -> Port {
            self.port
        }
        fn output(&self) -> Port {
            self.port
        }
        fn accept(&mut self, token: Token, _at: Position, out: &mut Outbox) -> Result<()> {
            out.emit(Sample::from_raw(token.sample.raw() + self.delta));
            Ok(())
        }
        fn reset(&mut self) {}
    }

    /// Emits nothing.
    #[derive(Debug)]
    struct Sink(Port);

    impl Stage for Sink {
        fn name(&self) -> &str {
            "sink"
        }
        fn input(&self) -> Port {
            self.0
        }
        fn output(&self) -> Port {
            self.0
        }
        fn accept(&mut self, _token: Token, _at: Position, _out: &mut Outbox) -> Result<()> {
            Ok(())
        }
        fn reset(&mut self) {}
    }

    fn offset(shape: FrameShape, delta: i32) -> Box<dyn Stage> {
        Box::new(Offset {
            port: Port::channel_major(shape),
            delta,
        })
    }

    #[test]
    fn channel_preserves_fifo_order() {
        let mut ch = Channel::new(2);
        assert!(ch.try_push(1).is_ok());
        assert!(ch.try_push(2).is_ok());
        assert_eq!(ch.try_push(3), Err(PushError::Full(3)));
        assert_eq!(ch.try_pop(), Some(1));
        assert!(ch.try_push(3).is_ok());
        assert_eq!(ch.try_pop(), Some(2));
        assert_eq!(ch.try_pop(), Some(3));
        assert_eq!(ch.try_pop(), None);
    }

    #[test]
    fn closed_channel_drains_before_end_of_stream() {
        let mut ch = Channel::new(4);
        ch.try_push('a').unwrap();
        ch.close();
        assert_eq!(ch.try_push('b'), Err(PushError::Closed('b')));
        assert!(!ch.is_drained());
        assert_eq!(ch.try_pop(), Some('a'));
        assert!(ch.is_drained());
    }

    #[test]
    fn zero_capacity_is_promoted() {
        let ch: Channel<u8> = Channel::new(0);
        assert_eq!(ch.capacity(), 1);
    }

    #[test]
    fn chained_stages_apply_in_order() {
        let shape = FrameShape::new(2, 2, 2);
        let mut pipe = Pipeline::new(vec![offset(shape, 1), offset(shape, 10)], 1).unwrap();
        let frame = FeatureMap::zeros(shape);
        let out = pipe.run_frame(&frame).unwrap();
        assert!(out.samples().iter().all(|s| s.raw() == 11));
        assert!(pipe.is_quiescent());

        // A second frame reuses the same stages.
        let out = pipe.run_frame(&out).unwrap();
        assert!(out.samples().iter().all(|s| s.raw() == 22));
    }

    #[test]
    fn mismatched_ports_fail_at_assembly() {
        let a = offset(FrameShape::new(2, 2, 2), 0);
        let b = offset(FrameShape::new(3, 2, 2), 0);
        let err = Pipeline::new(vec![a, b], 4).unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { .. }));
        assert!(Pipeline::new(Vec::new(), 4).is_err());
    }

    #[test]
    fn missing_output_is_a_marker_error() {
        let shape = FrameShape::new(1, 1, 2);
        let mut pipe = Pipeline::new(vec![Box::new(Sink(Port::channel_major(shape)))], 4).unwrap();
        let err = pipe.run_frame(&FeatureMap::zeros(shape)).unwrap_err();
        assert!(matches!(err, PipelineError::FrameMarker { .. }));
    }

    #[test]
    fn early_marker_is_a_marker_error() {
        let shape = FrameShape::new(1, 2, 2);
        let mut pipe = Pipeline::new(vec![offset(shape, 0)], 8).unwrap();
        pipe.try_feed(Token::body(Sample::ZERO)).unwrap();
        pipe.try_feed(Token::last(Sample::ZERO)).unwrap();
        pipe.step().unwrap();
        let err = pipe.step().unwrap_err();
        assert!(matches!(err, PipelineError::FrameMarker { .. }), "{err}");
    }

    #[test]
    fn overlong_frame_exhausts_stage_input() {
        let shape = FrameShape::new(1, 2, 2);
        let mut pipe = Pipeline::new(vec![offset(shape, 0)], 8).unwrap();
        for _ in 0..5 {
            pipe.try_feed(Token::body(Sample::ZERO)).unwrap();
        }
        let err = loop {
            match pipe.step() {
                Ok(_) => {}
                Err(e) => break e,
            }
        };
        assert_eq!(err, PipelineError::resource_exhaustion("offset", 4));
    }

    #[test]
    fn close_propagates_to_tail() {
        let shape = FrameShape::new(1, 1, 1);
        let mut pipe = Pipeline::new(vec![offset(shape, 5), offset(shape, 5)], 1).unwrap();
        pipe.try_feed(Token::last(Sample::ZERO)).unwrap();
        pipe.close_input();
        while pipe.step().unwrap() {}
        assert_eq!(pipe.try_drain(), Some(Token::last(Sample::from_raw(10))));
        assert!(pipe.is_finished());
    }

    #[test]
    fn reset_discards_buffered_tokens() {
        let shape = FrameShape::new(1, 2, 2);
        let mut pipe = Pipeline::new(vec![offset(shape, 1)], 8).unwrap();
        pipe.try_feed(Token::body(Sample::ZERO)).unwrap();
        pipe.step().unwrap();
        assert!(!pipe.is_quiescent());
        pipe.reset();
        assert!(pipe.is_quiescent());
        let out = pipe.run_frame(&FeatureMap::zeros(shape)).unwrap();
        assert!(out.samples().iter().all(|s| s.raw() == 1));
    }
}
