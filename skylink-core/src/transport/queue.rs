//! Outbound send queue with a frame-count bound.
//!
//! Only video frames count against the bound and only delta frames are
//! ever dropped. Control and input packets always go through.
//!
//! A drop leaves a gap the decoder can only cross at a keyframe. The
//! queue remembers that a resync is owed unless a keyframe is already
//! queued behind the gap, and hands the request out only once the
//! backlog is below the bound again.

use std::collections::VecDeque;

use crate::packet::Packet;

pub const DEFAULT_VIDEO_BOUND: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Keyframe,
    Delta,
    Other,
}

/// What happened to a pushed video packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// Queued after evicting the oldest queued delta frame.
    DroppedOldest,
    /// Nothing was evictable; the incoming delta frame was discarded.
    DroppedIncoming,
}

impl PushOutcome {
    pub fn dropped(self) -> bool {
        !matches!(self, PushOutcome::Queued)
    }
}

#[derive(Debug)]
pub struct SendQueue {
    items: VecDeque<(Kind, Packet)>,
    video_bound: usize,
    queued_video: usize,
    dropped: u64,
    resync: bool,
    closed: bool,
}

impl SendQueue {
    pub fn new(video_bound: usize) -> Self {
        Self {
            items: VecDeque::new(),
            video_bound: video_bound.max(1),
            queued_video: 0,
            dropped: 0,
            resync: false,
            closed: false,
        }
    }

    pub fn push_video(&mut self, packet: Packet, is_keyframe: bool) -> PushOutcome {
        let kind = if is_keyframe { Kind::Keyframe } else { Kind::Delta };
        let mut outcome = PushOutcome::Queued;

        if self.queued_video >= self.video_bound {
            match self.items.iter().position(|(k, _)| *k == Kind::Delta) {
                Some(oldest) => {
                    self.items.remove(oldest);
                    self.queued_video -= 1;
                    self.dropped += 1;
                    let covered = self
                        .items
                        .range(oldest..)
                        .any(|(k, _)| *k == Kind::Keyframe);
                    self.resync |= !covered;
                    outcome = PushOutcome::DroppedOldest;
                }
                None if !is_keyframe => {
                    self.dropped += 1;
                    self.resync = true;
                    return PushOutcome::DroppedIncoming;
                }
                // Only keyframes queued and a keyframe arriving: exceed the bound.
                None => {}
            }
        }

        if is_keyframe {
            self.resync = false;
        }
        self.items.push_back((kind, packet));
        self.queued_video += 1;
        outcome
    }

    pub fn push_control(&mut self, packet: Packet) {
        self.items.push_back((Kind::Other, packet));
    }

    /// Next packet in send order, and whether it is a video frame.
    pub fn pop(&mut self) -> Option<(Packet, bool)> {
        let (kind, packet) = self.items.pop_front()?;
        let is_video = kind != Kind::Other;
        if is_video {
            self.queued_video -= 1;
        }
        Some((packet, is_video))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Video frames currently queued.
    pub fn video_backlog(&self) -> usize {
        self.queued_video
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_video_full(&self) -> bool {
        self.queued_video >= self.video_bound
    }

    /// `true` once when a drop left no keyframe behind it. Held while the
    /// video backlog is at the bound.
    pub fn take_keyframe_request(&mut self) -> bool {
        if self.is_video_full() {
            return false;
        }
        std::mem::take(&mut self.resync)
    }

    /// No more pushes will be sent; the writer drains what is left.
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new(DEFAULT_VIDEO_BOUND)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageType;

    fn video(tag: u8) -> Packet {
        Packet::new(MessageType::VideoPacket, vec![tag]).unwrap()
    }

    fn drain(q: &mut SendQueue) -> Vec<u8> {
        std::iter::from_fn(|| q.pop()).map(|(p, _)| p.payload()[0]).collect()
    }

    #[test]
    fn oldest_delta_goes_first() {
        let mut q = SendQueue::new(3);
        assert_eq!(q.push_video(video(0), true), PushOutcome::Queued);
        q.push_video(video(1), false);
        q.push_video(video(2), false);
        assert_eq!(q.push_video(video(3), false), PushOutcome::DroppedOldest);
        assert_eq!(drain(&mut q), vec![0, 2, 3]);
        assert_eq!(q.dropped(), 1);
    }

    #[test]
    fn incoming_delta_dropped_when_only_keyframes_queued() {
        let mut q = SendQueue::new(2);
        q.push_video(video(0), true);
        q.push_video(video(1), true);
        assert_eq!(q.push_video(video(2), false), PushOutcome::DroppedIncoming);
        assert_eq!(q.push_video(video(3), true), PushOutcome::Queued);
        assert_eq!(drain(&mut q), vec![0, 1, 3]);
    }

    #[test]
    fn control_is_never_counted_or_dropped() {
        let mut q = SendQueue::new(1);
        q.push_video(video(0), false);
        for i in 0..10 {
            q.push_control(Packet::new(MessageType::Control, vec![100 + i]).unwrap());
        }
        assert_eq!(q.video_backlog(), 1);
        assert_eq!(q.len(), 11);
        assert_eq!(q.push_video(video(1), false), PushOutcome::DroppedOldest);
        assert_eq!(q.video_backlog(), 1);
        assert_eq!(q.len(), 11);
    }

    #[test]
    fn drop_before_a_queued_keyframe_needs_no_resync() {
        let mut q = SendQueue::new(3);
        q.push_video(video(0), false);
        q.push_video(video(1), true);
        q.push_video(video(2), false);
        assert_eq!(q.push_video(video(3), false), PushOutcome::DroppedOldest);
        q.pop();
        assert!(!q.take_keyframe_request());
    }

    #[test]
    fn resync_is_held_until_backlog_drains() {
        let mut q = SendQueue::new(2);
        q.push_video(video(0), true);
        q.push_video(video(1), false);
        assert_eq!(q.push_video(video(2), false), PushOutcome::DroppedOldest);
        assert!(q.is_video_full());
        assert!(!q.take_keyframe_request());

        q.pop();
        assert!(q.take_keyframe_request());
        assert!(!q.take_keyframe_request());
    }

    #[test]
    fn queued_keyframe_settles_an_owed_resync() {
        let mut q = SendQueue::new(1);
        q.push_video(video(0), false);
        assert_eq!(q.push_video(video(1), false), PushOutcome::DroppedOldest);
        assert_eq!(q.push_video(video(2), true), PushOutcome::DroppedOldest);
        q.pop();
        assert!(!q.take_keyframe_request());
    }
}
