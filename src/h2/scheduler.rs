//! Outbound frame scheduling
//!
//! The server connection queues every frame it wants to send as a
//! [`FrameWriteRequest`] and asks a [`WriteScheduler`] which one to write
//! next. Two strategies are provided:
//!
//! - [`PriorityWriteScheduler`] walks the RFC 7540 dependency tree, giving
//!   each sibling bandwidth in proportion to its weight.
//! - [`RandomWriteScheduler`] ignores priorities: control frames first, then
//!   any stream that can make progress.
//!
//! DATA requests are split when only part of the payload fits the
//! available flow-control credit or the peer's maximum frame size.

use super::error::{ErrorCode, Result};
use super::frames::{PrioritySpec, DEFAULT_WEIGHT};
use super::headers::HeaderField;
use super::settings::Settings;
use super::stream::StreamId;
use bytes::Bytes;
use crossbeam_channel::Sender;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;

/// What a [`FrameWriteRequest`] writes
#[derive(Debug, Clone)]
pub enum WriteFrame {
    Headers {
        fields: Vec<HeaderField>,
        end_stream: bool,
    },
    Data {
        data: Bytes,
        end_stream: bool,
    },
    WindowUpdate(u32),
    RstStream(ErrorCode),
    Settings(Settings),
    SettingsAck,
    Ping {
        ack: bool,
        data: [u8; 8],
    },
    GoAway {
        last_stream_id: StreamId,
        code: ErrorCode,
        debug_data: Bytes,
    },
}

/// A queued outbound frame
///
/// `done`, when present, receives the outcome once the frame has been
/// written (or dropped because its stream went away).
pub struct FrameWriteRequest {
    /// Stream the frame is addressed to on the wire
    pub stream_id: StreamId,
    pub write: WriteFrame,
    pub done: Option<Sender<Result<()>>>,
    /// Queued on the connection-level control queue rather than the
    /// stream's own queue
    control: bool,
}

impl fmt::Debug for FrameWriteRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameWriteRequest")
            .field("stream_id", &self.stream_id)
            .field("write", &self.write)
            .field("control", &self.control)
            .field("has_done", &self.done.is_some())
            .finish()
    }
}

/// Outcome of [`FrameWriteRequest::consume`]
#[derive(Debug)]
pub enum Consumed {
    /// Nothing can be written yet; the request is handed back unchanged
    Blocked(FrameWriteRequest),
    /// Write the whole request
    Whole(FrameWriteRequest),
    /// Write the first part now; the second stays queued
    Split(FrameWriteRequest, FrameWriteRequest),
}

/// Send-side flow-control view the schedulers consume credit from
pub trait SendCredit {
    /// Bytes `stream` may send now (stream and connection credit combined)
    fn available(&self, stream: StreamId) -> i32;

    /// Charge `n` bytes against both windows
    fn take(&mut self, stream: StreamId, n: u32);

    /// Peer's SETTINGS_MAX_FRAME_SIZE
    fn max_frame_size(&self) -> u32;
}

impl FrameWriteRequest {
    /// A connection-level frame (SETTINGS, PING, GOAWAY, ...)
    pub fn control(write: WriteFrame) -> Self {
        FrameWriteRequest {
            stream_id: 0,
            write,
            done: None,
            control: true,
        }
    }

    /// A frame for `stream_id` that must not wait behind the stream's data
    pub fn control_for(stream_id: StreamId, write: WriteFrame) -> Self {
        FrameWriteRequest {
            stream_id,
            write,
            done: None,
            control: true,
        }
    }

    /// A frame queued behind the stream's earlier frames
    pub fn stream(stream_id: StreamId, write: WriteFrame) -> Self {
        FrameWriteRequest {
            stream_id,
            write,
            done: None,
            control: false,
        }
    }

    /// Ask to be told when the frame has been written
    pub fn with_done(mut self, done: Sender<Result<()>>) -> Self {
        self.done = Some(done);
        self
    }

    pub fn is_control(&self) -> bool {
        self.control
    }

    /// Flow-controlled payload size
    pub fn data_size(&self) -> usize {
        match &self.write {
            WriteFrame::Data { data, .. } => data.len(),
            _ => 0,
        }
    }

    /// True when this request closes the sending side of its stream
    pub fn ends_stream(&self) -> bool {
        match &self.write {
            WriteFrame::Data { end_stream, .. } | WriteFrame::Headers { end_stream, .. } => {
                *end_stream
            }
            WriteFrame::RstStream(_) => true,
            _ => false,
        }
    }

    /// Report the write outcome to whoever is waiting
    pub fn complete(self, result: Result<()>) {
        if let Some(done) = self.done {
            let _ = done.send(result);
        }
    }

    /// Take up to `limit` bytes of DATA, bounded by credit and frame size
    ///
    /// Non-DATA requests and empty DATA frames are always consumed whole.
    pub fn consume(self, limit: i32, credit: &mut dyn SendCredit) -> Consumed {
        let (data, end_stream) = match &self.write {
            WriteFrame::Data { data, end_stream } if !data.is_empty() => {
                (data.clone(), *end_stream)
            }
            _ => return Consumed::Whole(self),
        };

        let allowed = credit
            .available(self.stream_id)
            .min(limit)
            .min(credit.max_frame_size().min(i32::MAX as u32) as i32);
        if allowed <= 0 {
            return Consumed::Blocked(self);
        }

        let allowed = allowed as usize;
        if data.len() > allowed {
            credit.take(self.stream_id, allowed as u32);
            let first = FrameWriteRequest {
                stream_id: self.stream_id,
                write: WriteFrame::Data {
                    data: data.slice(..allowed),
                    end_stream: false,
                },
                done: None,
                control: self.control,
            };
            let rest = FrameWriteRequest {
                stream_id: self.stream_id,
                write: WriteFrame::Data {
                    data: data.slice(allowed..),
                    end_stream,
                },
                done: self.done,
                control: self.control,
            };
            return Consumed::Split(first, rest);
        }

        credit.take(self.stream_id, data.len() as u32);
        Consumed::Whole(self)
    }
}

/// Pop from a FIFO queue, splitting the head if needed
fn consume_queue(
    queue: &mut VecDeque<FrameWriteRequest>,
    limit: i32,
    credit: &mut dyn SendCredit,
) -> Option<FrameWriteRequest> {
    let head = queue.pop_front()?;
    match head.consume(limit, credit) {
        Consumed::Blocked(head) => {
            queue.push_front(head);
            None
        }
        Consumed::Whole(wr) => Some(wr),
        Consumed::Split(first, rest) => {
            queue.push_front(rest);
            Some(first)
        }
    }
}

/// Chooses the order in which queued frames are written
pub trait WriteScheduler: Send {
    /// A stream was opened
    fn open_stream(&mut self, id: StreamId);

    /// A stream was closed; its queued frames are dropped
    fn close_stream(&mut self, id: StreamId);

    /// Apply a PRIORITY frame or HEADERS priority block
    fn adjust_stream(&mut self, id: StreamId, priority: PrioritySpec);

    /// Queue a frame
    fn push(&mut self, wr: FrameWriteRequest);

    /// Next frame to write, if any can make progress under `credit`
    fn pop(&mut self, credit: &mut dyn SendCredit) -> Option<FrameWriteRequest>;
}

/// Tuning for [`PriorityWriteScheduler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySchedulerConfig {
    /// Closed streams kept in the tree
    pub max_closed_nodes: usize,
    /// Idle streams (created by PRIORITY frames) kept in the tree
    pub max_idle_nodes: usize,
    /// Limit how much a descendant may send while an ancestor is open
    pub throttle_out_of_order_writes: bool,
}

impl Default for PrioritySchedulerConfig {
    fn default() -> Self {
        PrioritySchedulerConfig {
            max_closed_nodes: 10,
            max_idle_nodes: 10,
            throttle_out_of_order_writes: true,
        }
    }
}

/// First throttle step, and the increment per throttled write
const WRITE_THROTTLE_STEP: i32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeState {
    Idle,
    Open,
    Closed,
}

#[derive(Debug)]
struct PriorityNode {
    queue: VecDeque<FrameWriteRequest>,
    /// Wire weight; effective weight is this plus one
    weight: u8,
    state: NodeState,
    /// Bytes written by this node (reset when it closes)
    bytes: i64,
    /// Bytes written by this node and all its descendants
    subtree_bytes: i64,
    parent: Option<StreamId>,
    kids: Vec<StreamId>,
}

impl PriorityNode {
    fn new(state: NodeState) -> Self {
        PriorityNode {
            queue: VecDeque::new(),
            weight: DEFAULT_WEIGHT,
            state,
            bytes: 0,
            subtree_bytes: 0,
            parent: None,
            kids: Vec::new(),
        }
    }
}

/// RFC 7540 priority-tree scheduler
///
/// Node 0 is the connection root and holds the control queue. Children are
/// visited before siblings, siblings in order of bytes written relative to
/// weight, so a starved sibling goes first.
pub struct PriorityWriteScheduler {
    nodes: HashMap<StreamId, PriorityNode>,
    max_id: StreamId,
    closed_nodes: VecDeque<StreamId>,
    idle_nodes: VecDeque<StreamId>,
    config: PrioritySchedulerConfig,
    write_throttle_limit: i32,
}

impl PriorityWriteScheduler {
    pub fn new(config: PrioritySchedulerConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, PriorityNode::new(NodeState::Open));
        PriorityWriteScheduler {
            nodes,
            max_id: 0,
            closed_nodes: VecDeque::new(),
            idle_nodes: VecDeque::new(),
            config,
            write_throttle_limit: if config.throttle_out_of_order_writes {
                WRITE_THROTTLE_STEP
            } else {
                i32::MAX
            },
        }
    }

    /// Parent of a node still in the tree
    pub fn parent_of(&self, id: StreamId) -> Option<StreamId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Children of a node, in visiting order
    pub fn kids_of(&self, id: StreamId) -> Vec<StreamId> {
        self.nodes.get(&id).map(|n| n.kids.clone()).unwrap_or_default()
    }

    /// Effective weight of a node
    pub fn weight_of(&self, id: StreamId) -> Option<u16> {
        self.nodes.get(&id).map(|n| n.weight as u16 + 1)
    }

    pub fn contains(&self, id: StreamId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Move `id` under `parent`, inserting it first among the new siblings
    fn set_parent(&mut self, id: StreamId, parent: Option<StreamId>) {
        let old = self.nodes.get(&id).and_then(|n| n.parent);
        if let Some(old) = old {
            if let Some(node) = self.nodes.get_mut(&old) {
                node.kids.retain(|k| *k != id);
            }
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent = parent;
        }
        if let Some(parent) = parent {
            if let Some(node) = self.nodes.get_mut(&parent) {
                node.kids.insert(0, id);
            }
        }
    }

    fn add_bytes(&mut self, id: StreamId, b: i64) {
        if let Some(node) = self.nodes.get_mut(&id) {
            node.bytes += b;
        }
        let mut cur = Some(id);
        while let Some(n) = cur {
            match self.nodes.get_mut(&n) {
                Some(node) => {
                    node.subtree_bytes += b;
                    cur = node.parent;
                }
                None => break,
            }
        }
    }

    fn remove_node(&mut self, id: StreamId) {
        let (parent, kids) = match self.nodes.get(&id) {
            Some(node) => (node.parent, node.kids.clone()),
            None => return,
        };
        for kid in kids.into_iter().rev() {
            self.set_parent(kid, parent);
        }
        self.set_parent(id, None);
        self.nodes.remove(&id);
    }

    fn retain_closed(&mut self, id: StreamId) {
        let max = self.config.max_closed_nodes;
        if max == 0 {
            self.remove_node(id);
            return;
        }
        if self.closed_nodes.len() == max {
            if let Some(oldest) = self.closed_nodes.pop_front() {
                self.remove_node(oldest);
            }
        }
        self.closed_nodes.push_back(id);
    }

    fn retain_idle(&mut self, id: StreamId) {
        let max = self.config.max_idle_nodes;
        if self.idle_nodes.len() == max {
            if let Some(oldest) = self.idle_nodes.pop_front() {
                self.remove_node(oldest);
            }
        }
        self.idle_nodes.push_back(id);
    }

    /// Sibling order: fewer bytes per unit of weight first, heavier first
    /// on a tie
    fn sibling_order(&self, a: StreamId, b: StreamId) -> Ordering {
        let (na, nb) = match (self.nodes.get(&a), self.nodes.get(&b)) {
            (Some(na), Some(nb)) => (na, nb),
            _ => return Ordering::Equal,
        };
        let wa = na.weight as i128 + 1;
        let wb = nb.weight as i128 + 1;
        let lhs = na.subtree_bytes as i128 * wb;
        let rhs = nb.subtree_bytes as i128 * wa;
        lhs.cmp(&rhs).then(wb.cmp(&wa))
    }

    fn try_consume(
        &mut self,
        id: StreamId,
        open_parent: bool,
        credit: &mut dyn SendCredit,
    ) -> Option<FrameWriteRequest> {
        let limit = if open_parent {
            self.write_throttle_limit
        } else {
            i32::MAX
        };
        let node = self.nodes.get_mut(&id)?;
        let wr = consume_queue(&mut node.queue, limit, credit)?;
        self.add_bytes(id, wr.data_size() as i64);

        // A descendant keeps getting data out while its open ancestor has
        // none: let it take progressively more.
        if open_parent {
            self.write_throttle_limit = self.write_throttle_limit.saturating_add(WRITE_THROTTLE_STEP);
        } else if self.config.throttle_out_of_order_writes {
            self.write_throttle_limit = WRITE_THROTTLE_STEP;
        }
        Some(wr)
    }

    fn walk_ready_in_order(
        &mut self,
        id: StreamId,
        open_parent: bool,
        credit: &mut dyn SendCredit,
    ) -> Option<FrameWriteRequest> {
        if let Some(wr) = self.try_consume(id, open_parent, credit) {
            return Some(wr);
        }

        let (state, mut kids) = match self.nodes.get(&id) {
            Some(node) if !node.kids.is_empty() => (node.state, node.kids.clone()),
            _ => return None,
        };
        // The root is never "open" for this purpose: it carries no DATA.
        let open_parent = if id != 0 {
            open_parent || state == NodeState::Open
        } else {
            open_parent
        };

        let first_weight = self.nodes.get(&kids[0]).map(|n| n.weight);
        let need_sort = kids
            .iter()
            .any(|k| self.nodes.get(k).map(|n| n.weight) != first_weight);
        if need_sort {
            kids.sort_by(|a, b| self.sibling_order(*a, *b));
            if let Some(node) = self.nodes.get_mut(&id) {
                node.kids = kids.clone();
            }
        }

        for kid in kids {
            if let Some(wr) = self.walk_ready_in_order(kid, open_parent, credit) {
                return Some(wr);
            }
        }
        None
    }
}

impl Default for PriorityWriteScheduler {
    fn default() -> Self {
        Self::new(PrioritySchedulerConfig::default())
    }
}

impl WriteScheduler for PriorityWriteScheduler {
    fn open_stream(&mut self, id: StreamId) {
        if let Some(node) = self.nodes.get_mut(&id) {
            // Created earlier by a PRIORITY frame.
            if node.state == NodeState::Idle {
                node.state = NodeState::Open;
                self.idle_nodes.retain(|n| *n != id);
            }
            return;
        }

        // RFC 9113 Section 5.3.5: new streams depend on stream 0.
        self.nodes.insert(id, PriorityNode::new(NodeState::Open));
        self.set_parent(id, Some(0));
        self.max_id = self.max_id.max(id);
    }

    fn close_stream(&mut self, id: StreamId) {
        if id == 0 {
            return;
        }
        let bytes = match self.nodes.get_mut(&id) {
            Some(node) if node.state == NodeState::Open => {
                node.state = NodeState::Closed;
                node.queue.clear();
                node.bytes
            }
            _ => return,
        };
        self.add_bytes(id, -bytes);
        self.retain_closed(id);
    }

    fn adjust_stream(&mut self, id: StreamId, priority: PrioritySpec) {
        if id == 0 {
            return;
        }
        if !self.nodes.contains_key(&id) {
            if id <= self.max_id || self.config.max_idle_nodes == 0 {
                return;
            }
            self.max_id = id;
            self.nodes.insert(id, PriorityNode::new(NodeState::Idle));
            self.set_parent(id, Some(0));
            self.retain_idle(id);
        }

        let parent = priority.stream_dependency;
        if !self.nodes.contains_key(&parent) {
            // Dependency on a stream not in the tree: default priority.
            self.set_parent(id, Some(0));
            if let Some(node) = self.nodes.get_mut(&id) {
                node.weight = DEFAULT_WEIGHT;
            }
            return;
        }
        if parent == id {
            return;
        }

        // Depending on one of our own descendants: that descendant first
        // moves up to our previous parent (RFC 7540 Section 5.3.3).
        let mut cur = self.parent_of(parent);
        while let Some(x) = cur {
            if x == id {
                let our_parent = self.parent_of(id);
                self.set_parent(parent, our_parent);
                break;
            }
            cur = self.parent_of(x);
        }

        if priority.exclusive {
            for kid in self.kids_of(parent) {
                if kid != id {
                    self.set_parent(kid, Some(id));
                }
            }
        }

        self.set_parent(id, Some(parent));
        if let Some(node) = self.nodes.get_mut(&id) {
            node.weight = priority.weight;
        }
    }

    fn push(&mut self, wr: FrameWriteRequest) {
        let target = if wr.is_control() {
            0
        } else {
            match self.nodes.get(&wr.stream_id) {
                Some(node) if node.state == NodeState::Open => wr.stream_id,
                _ => {
                    // Only non-DATA frames may target a stream that is
                    // not open; they go out with the control frames.
                    debug_assert!(wr.data_size() == 0, "DATA queued on a non-open stream");
                    0
                }
            }
        };
        if let Some(node) = self.nodes.get_mut(&target) {
            node.queue.push_back(wr);
        }
    }

    fn pop(&mut self, credit: &mut dyn SendCredit) -> Option<FrameWriteRequest> {
        self.walk_ready_in_order(0, false, credit)
    }
}

/// Priority-oblivious scheduler
///
/// Control frames go first; otherwise a ready stream is picked at random.
#[derive(Default)]
pub struct RandomWriteScheduler {
    control: VecDeque<FrameWriteRequest>,
    streams: HashMap<StreamId, VecDeque<FrameWriteRequest>>,
}

impl RandomWriteScheduler {
    pub fn new() -> Self {
        RandomWriteScheduler::default()
    }
}

impl WriteScheduler for RandomWriteScheduler {
    fn open_stream(&mut self, _id: StreamId) {}

    fn close_stream(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    fn adjust_stream(&mut self, _id: StreamId, _priority: PrioritySpec) {}

    fn push(&mut self, wr: FrameWriteRequest) {
        if wr.is_control() {
            self.control.push_back(wr);
        } else {
            self.streams.entry(wr.stream_id).or_default().push_back(wr);
        }
    }

    fn pop(&mut self, credit: &mut dyn SendCredit) -> Option<FrameWriteRequest> {
        if let Some(wr) = self.control.pop_front() {
            return Some(wr);
        }

        let mut ids: Vec<StreamId> = self.streams.keys().copied().collect();
        ids.shuffle(&mut rand::thread_rng());
        for id in ids {
            let Some(queue) = self.streams.get_mut(&id) else {
                continue;
            };
            let Some(wr) = consume_queue(queue, i32::MAX, credit) else {
                continue;
            };
            if queue.is_empty() {
                self.streams.remove(&id);
            }
            return Some(wr);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    /// Unlimited credit, fixed frame size
    struct Unlimited(u32);

    impl SendCredit for Unlimited {
        fn available(&self, _stream: StreamId) -> i32 {
            i32::MAX
        }
        fn take(&mut self, _stream: StreamId, _n: u32) {}
        fn max_frame_size(&self) -> u32 {
            self.0
        }
    }

    /// Per-stream windows only
    struct Windows(HashMap<StreamId, i32>);

    impl SendCredit for Windows {
        fn available(&self, stream: StreamId) -> i32 {
            self.0.get(&stream).copied().unwrap_or(0)
        }
        fn take(&mut self, stream: StreamId, n: u32) {
            *self.0.entry(stream).or_default() -= n as i32;
        }
        fn max_frame_size(&self) -> u32 {
            16384
        }
    }

    fn data(id: StreamId, len: usize, end_stream: bool) -> FrameWriteRequest {
        FrameWriteRequest::stream(
            id,
            WriteFrame::Data {
                data: Bytes::from(vec![0u8; len]),
                end_stream,
            },
        )
    }

    fn priority(dep: StreamId, exclusive: bool, weight: u8) -> PrioritySpec {
        PrioritySpec::new(dep, exclusive, weight)
    }

    #[test]
    fn test_consume_splits_on_credit() {
        let mut credit = Windows(HashMap::from([(1, 100)]));
        match data(1, 250, true).consume(i32::MAX, &mut credit) {
            Consumed::Split(first, rest) => {
                assert_eq!(first.data_size(), 100);
                assert!(!first.ends_stream());
                assert_eq!(rest.data_size(), 150);
                assert!(rest.ends_stream());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(credit.available(1), 0);
        assert!(matches!(
            data(1, 10, false).consume(i32::MAX, &mut credit),
            Consumed::Blocked(_)
        ));
    }

    #[test]
    fn test_empty_data_needs_no_credit() {
        let mut credit = Windows(HashMap::new());
        assert!(matches!(
            data(1, 0, true).consume(i32::MAX, &mut credit),
            Consumed::Whole(_)
        ));
    }

    #[test]
    fn test_control_frames_first() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        ws.push(data(1, 10, false));
        ws.push(FrameWriteRequest::control(WriteFrame::SettingsAck));

        let mut credit = Unlimited(16384);
        let first = ws.pop(&mut credit).unwrap();
        assert!(matches!(first.write, WriteFrame::SettingsAck));
        assert_eq!(ws.pop(&mut credit).unwrap().stream_id, 1);
        assert!(ws.pop(&mut credit).is_none());
    }

    #[test]
    fn test_weighted_siblings_converge() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        ws.open_stream(3);
        ws.adjust_stream(1, priority(0, false, 199));
        ws.adjust_stream(3, priority(0, false, 49));
        ws.push(data(1, 4_000_000, true));
        ws.push(data(3, 4_000_000, true));

        let mut credit = Unlimited(1000);
        let mut sent: HashMap<StreamId, usize> = HashMap::new();
        for _ in 0..2000 {
            let wr = ws.pop(&mut credit).unwrap();
            *sent.entry(wr.stream_id).or_default() += wr.data_size();
        }

        let ratio = sent[&1] as f64 / sent[&3] as f64;
        assert!((3.9..=4.1).contains(&ratio), "ratio {}", ratio);
    }

    #[test]
    fn test_throttle_descendant_of_open_stream() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        ws.open_stream(3);
        ws.adjust_stream(3, priority(1, false, DEFAULT_WEIGHT));
        ws.push(data(3, 100_000, false));

        let mut credit = Unlimited(16384);
        let sizes: Vec<usize> = (0..3).map(|_| ws.pop(&mut credit).unwrap().data_size()).collect();
        assert_eq!(sizes, vec![1024, 2048, 3072]);
    }

    #[test]
    fn test_exclusive_dependency() {
        let mut ws = PriorityWriteScheduler::default();
        for id in [1, 3, 5] {
            ws.open_stream(id);
        }
        ws.adjust_stream(5, priority(0, true, DEFAULT_WEIGHT));

        assert_eq!(ws.kids_of(0), vec![5]);
        let mut kids = ws.kids_of(5);
        kids.sort();
        assert_eq!(kids, vec![1, 3]);
    }

    #[test]
    fn test_depend_on_own_descendant() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        ws.open_stream(3);
        ws.adjust_stream(3, priority(1, false, 99));
        assert_eq!(ws.parent_of(3), Some(1));

        ws.adjust_stream(1, priority(3, false, 49));
        assert_eq!(ws.parent_of(3), Some(0));
        assert_eq!(ws.parent_of(1), Some(3));
        assert_eq!(ws.weight_of(3), Some(100));
        assert_eq!(ws.weight_of(1), Some(50));
    }

    #[test]
    fn test_unknown_dependency_gets_default_priority() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        ws.adjust_stream(1, priority(99, false, 200));
        assert_eq!(ws.parent_of(1), Some(0));
        assert_eq!(ws.weight_of(1), Some(16));
    }

    #[test]
    fn test_closed_nodes_retained_then_evicted() {
        let config = PrioritySchedulerConfig {
            max_closed_nodes: 2,
            ..Default::default()
        };
        let mut ws = PriorityWriteScheduler::new(config);
        for id in [1, 3, 5] {
            ws.open_stream(id);
        }
        ws.open_stream(7);
        ws.adjust_stream(7, priority(1, false, DEFAULT_WEIGHT));

        ws.close_stream(1);
        ws.close_stream(3);
        assert!(ws.contains(1));
        assert!(ws.contains(3));
        assert_eq!(ws.parent_of(7), Some(1));

        ws.close_stream(5);
        assert!(!ws.contains(1));
        assert!(ws.contains(3) && ws.contains(5));
        // Stream 7 inherits its removed parent's parent.
        assert_eq!(ws.parent_of(7), Some(0));
    }

    #[test]
    fn test_priority_frame_creates_idle_node() {
        let mut ws = PriorityWriteScheduler::default();
        ws.adjust_stream(11, priority(0, false, 63));
        assert!(ws.contains(11));
        assert_eq!(ws.weight_of(11), Some(64));

        ws.open_stream(11);
        ws.push(data(11, 5, true));
        let mut credit = Unlimited(16384);
        assert_eq!(ws.pop(&mut credit).unwrap().stream_id, 11);
    }

    #[test]
    fn test_close_drops_queued_frames_and_signals() {
        let mut ws = PriorityWriteScheduler::default();
        ws.open_stream(1);
        let (tx, rx) = crossbeam_channel::bounded(1);
        ws.push(data(1, 10, false).with_done(tx));
        ws.close_stream(1);

        assert!(rx.recv().is_err());
        assert!(ws.pop(&mut Unlimited(16384)).is_none());
    }

    #[test]
    fn test_random_scheduler_preserves_stream_order() {
        let mut ws = RandomWriteScheduler::new();
        ws.push(data(1, 5, false));
        ws.push(data(1, 6, true));
        ws.push(FrameWriteRequest::control_for(3, WriteFrame::RstStream(ErrorCode::Cancel)));

        let mut credit = Unlimited(16384);
        let first = ws.pop(&mut credit).unwrap();
        assert!(matches!(first.write, WriteFrame::RstStream(ErrorCode::Cancel)));
        assert_eq!(ws.pop(&mut credit).unwrap().data_size(), 5);
        assert_eq!(ws.pop(&mut credit).unwrap().data_size(), 6);
        assert!(ws.pop(&mut credit).is_none());
    }

    #[test]
    fn test_random_scheduler_picks_any_ready_stream() {
        let mut seen = HashSet::new();
        for _ in 0..64 {
            let mut ws = RandomWriteScheduler::new();
            ws.push(data(1, 5, false));
            ws.push(data(3, 5, false));
            seen.insert(ws.pop(&mut Unlimited(16384)).unwrap().stream_id);
        }
        assert_eq!(seen, HashSet::from([1, 3]));
    }

    #[test]
    fn test_random_scheduler_skips_blocked_streams() {
        let mut ws = RandomWriteScheduler::new();
        ws.push(data(1, 5, false));
        ws.push(data(3, 5, false));

        let mut credit = Windows(HashMap::from([(3, 100)]));
        assert_eq!(ws.pop(&mut credit).unwrap().stream_id, 3);
        assert!(ws.pop(&mut credit).is_none());
    }
}
