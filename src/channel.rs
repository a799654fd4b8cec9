//! A transactional multi-cast FIFO channel.
//!
//! The channel body is a linked list whose links are `Var`s: the channel
//! holds the tail, each reader holds a cursor into the list. Writers append
//! behind the tail; a reader consumes its cursor's successor and advances.
//! Every reader sees every message written after the reader was created, in
//! commit order, and nodes are reclaimed once the last cursor has moved
//! past them.

use std::any::Any;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::result::{
    AtomicRunError, InvalidChannelError, StmError, StmResult, TransactionClosureResult,
    TransactionError,
};
use crate::time::TimeArg;
use crate::transaction::{
    atomically, atomically_with_err, atomically_with_opts_and_err, AtomicOptions,
    ConflictResolution, Transaction, TransactionLocalValue,
};
use crate::tvar::Var;

/// `read_all_atomic` gives up on optimistic runs after this many conflicts
/// and finishes locked, so a busy channel cannot starve its readers.
const MAX_READ_ALL_CONFLICTS: u32 = 5;

struct Node<T> {
    data: Option<T>,
    next_v: Var<Option<Arc<Node<T>>>>,
    initial: bool,
}

impl<T> Node<T>
where
    T: Any + Send + Sync + Clone,
{
    /// The sentinel at the tail of every channel. It carries no payload and
    /// is never delivered.
    fn sentinel() -> Arc<Node<T>> {
        Arc::new(Node {
            data: None,
            next_v: Var::new(None),
            initial: false,
        })
    }

    fn message(data: T) -> Arc<Node<T>> {
        Arc::new(Node {
            data: Some(data),
            next_v: Var::new(None),
            initial: false,
        })
    }

    /// A node synthesized for one new reader: its payload is delivered only
    /// to that reader, after which the reader continues at `next`.
    fn first_message(data: T, next: Arc<Node<T>>) -> Arc<Node<T>> {
        Arc::new(Node {
            data: Some(data),
            next_v: Var::new(Some(next)),
            initial: true,
        })
    }
}

type SignalCallback = Arc<dyn Fn() + Send + Sync>;

struct WriteSignal {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, SignalCallback)>>,
}

impl WriteSignal {
    fn new() -> WriteSignal {
        WriteSignal {
            next_id: AtomicU64::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn connect(self: &Arc<Self>, callback: SignalCallback) -> SignalConnection {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, callback));
        SignalConnection {
            id,
            signal: Arc::downgrade(self),
        }
    }

    fn disconnect(&self, id: u64) {
        self.subscribers.lock().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Called from an after-hook, outside any transaction. The lock is not
    /// held while the callbacks run.
    fn emit(&self) {
        let callbacks: Vec<SignalCallback> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, callback)| callback.clone())
            .collect();
        for callback in callbacks {
            callback();
        }
    }
}

/// Handle for a callback hooked to a channel's write signal. Dropping the
/// connection does not disconnect; call [`SignalConnection::disconnect`].
pub struct SignalConnection {
    id: u64,
    signal: Weak<WriteSignal>,
}

impl SignalConnection {
    pub fn disconnect(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.disconnect(self.id);
        }
        self.signal = Weak::new();
    }

    pub fn is_connected(&self) -> bool {
        self.signal.upgrade().is_some()
    }
}

/// Builds the first message a new reader sees; runs in the transaction
/// that creates the reader.
pub type ReaderInitFn<T> = Arc<dyn Fn(&mut Transaction) -> StmResult<T> + Send + Sync>;

struct ChannelCore<T> {
    write_signal: Arc<WriteSignal>,
    tail_v: Var<Arc<Node<T>>>,
    reader_init: Mutex<Option<ReaderInitFn<T>>>,
    num_readers_v: Var<i64>,
}

impl<T> ChannelCore<T>
where
    T: Any + Send + Sync + Clone,
{
    fn new(reader_init: Option<ReaderInitFn<T>>) -> Arc<ChannelCore<T>> {
        Arc::new(ChannelCore {
            write_signal: Arc::new(WriteSignal::new()),
            tail_v: Var::new(Node::sentinel()),
            reader_init: Mutex::new(reader_init),
            num_readers_v: Var::new(0),
        })
    }

    fn write(&self, at: &mut Transaction, data: T) -> StmResult<()> {
        if self.num_readers_v.read(at)? == 0 {
            // Not just an optimization: nodes queued while nobody reads
            // would form an unbounded chain that nothing ever consumes,
            // and releasing such a chain in one go cascades drops through
            // every link.
            return Ok(());
        }

        let node = Node::message(data);
        let tail = self.tail_v.read(at)?;
        tail.next_v.write(at, Some(node.clone()))?;
        self.tail_v.write(at, node)?;

        let signal = Arc::downgrade(&self.write_signal);
        at.after(move || {
            if let Some(signal) = signal.upgrade() {
                signal.emit();
            }
        });
        Ok(())
    }

    fn add_reader(&self, at: &mut Transaction) -> StmResult<Arc<Node<T>>> {
        self.num_readers_v.modify(at, |n| n + 1)?;
        let tail = self.tail_v.read(at)?;
        let init = self.reader_init.lock().clone();
        match init {
            Some(init) => Ok(Node::first_message(init(at)?, tail)),
            None => Ok(tail),
        }
    }

    fn remove_reader(&self, at: &mut Transaction) -> StmResult<()> {
        let readers = self.num_readers_v.read(at)?;
        if readers > 0 {
            self.num_readers_v.write(at, readers - 1)?;
        }
        Ok(())
    }
}

/// The write end of a transactional multi-cast channel.
///
/// A channel is not clonable; share it through [`ChannelWriter`] and
/// [`ReadOnlyChannel`] handles, which hold the channel weakly, or through
/// readers, which keep it alive.
pub struct Channel<T> {
    core: Arc<ChannelCore<T>>,
}

impl<T> Channel<T>
where
    T: Any + Send + Sync + Clone,
{
    /// Creates an empty channel with no reader-init function.
    pub fn new() -> Channel<T> {
        Channel {
            core: ChannelCore::new(None),
        }
    }

    /// Creates an empty channel whose readers each receive the value built
    /// by `init` as their first message.
    pub fn with_reader_init<F>(init: F) -> Channel<T>
    where
        F: Fn(&mut Transaction) -> StmResult<T> + Send + Sync + 'static,
    {
        Channel {
            core: ChannelCore::new(Some(Arc::new(init))),
        }
    }

    /// Replaces the reader-init function for readers created from now on.
    pub fn set_reader_init<F>(&self, init: F)
    where
        F: Fn(&mut Transaction) -> StmResult<T> + Send + Sync + 'static,
    {
        *self.core.reader_init.lock() = Some(Arc::new(init));
    }

    /// Writes a message.
    ///
    /// A message written while the channel has no readers is silently
    /// discarded — including between the release of the last reader and
    /// the creation of the next one. This keeps an unread channel from
    /// accumulating an unbounded node chain.
    pub fn write(&self, at: &mut Transaction, data: T) -> StmResult<()> {
        self.core.write(at, data)
    }

    /// [`Channel::write`] in its own transaction.
    pub fn write_atomic(&self, data: T) {
        atomically(|at| self.core.write(at, data.clone()));
    }

    /// Hooks `callback` to run after each commit that wrote to this
    /// channel. Mainly useful to bridge channel activity into event loops;
    /// to consume messages, prefer a reader and [`ChannelReader::wait`].
    pub fn connect_to_write_signal<F>(&self, callback: F) -> SignalConnection
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.core.write_signal.connect(Arc::new(callback))
    }
}

impl<T> Default for Channel<T>
where
    T: Any + Send + Sync + Clone,
{
    fn default() -> Self {
        Channel::new()
    }
}

/// A read-only view of a channel, good for creating readers and hooking
/// the write signal. Holds the channel weakly: it stays usable while the
/// original channel or any reader keeps the channel alive.
pub struct ReadOnlyChannel<T> {
    core_v: Var<Weak<ChannelCore<T>>>,
}

impl<T> ReadOnlyChannel<T>
where
    T: Any + Send + Sync + Clone,
{
    pub fn new(channel: &Channel<T>) -> ReadOnlyChannel<T> {
        ReadOnlyChannel {
            core_v: Var::new(Arc::downgrade(&channel.core)),
        }
    }

    /// Points this view at `channel`.
    pub fn init(&self, at: &mut Transaction, channel: &Channel<T>) -> StmResult<()> {
        self.core_v.write(at, Arc::downgrade(&channel.core))
    }

    /// Points this view at whatever `other` views.
    pub fn init_from(&self, at: &mut Transaction, other: &ReadOnlyChannel<T>) -> StmResult<()> {
        let weak = other.core_v.read(at)?;
        self.core_v.write(at, weak)
    }

    pub fn valid(&self, at: &mut Transaction) -> StmResult<bool> {
        Ok(self.core_v.read(at)?.upgrade().is_some())
    }

    pub fn is_valid(&self) -> bool {
        self.core_v.read_atomic().upgrade().is_some()
    }

    /// Drops this view's hold on the channel.
    pub fn release(&self, at: &mut Transaction) -> StmResult<()> {
        self.core_v.write(at, Weak::new())
    }

    pub fn release_atomic(&self) {
        atomically(|at| self.release(at));
    }

    /// Hooks `callback` to the underlying channel's write signal.
    pub fn connect_to_write_signal<F>(
        &self,
        callback: F,
    ) -> Result<SignalConnection, InvalidChannelError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        match self.core_v.read_atomic().upgrade() {
            Some(core) => Ok(core.write_signal.connect(Arc::new(callback))),
            None => Err(InvalidChannelError),
        }
    }

    pub(crate) fn upgrade(&self, at: &mut Transaction) -> StmResult<Option<Arc<ChannelCore<T>>>> {
        Ok(self.core_v.read(at)?.upgrade())
    }
}

impl<T> Clone for ReadOnlyChannel<T>
where
    T: Any + Send + Sync + Clone,
{
    fn clone(&self) -> Self {
        ReadOnlyChannel {
            core_v: Var::new(self.core_v.read_atomic()),
        }
    }
}

/// A weak write handle to a channel. Writes fail once the channel itself
/// and all its readers are gone, so an abandoned channel's resources are
/// not kept alive by its writers.
pub struct ChannelWriter<T> {
    core: Weak<ChannelCore<T>>,
}

impl<T> Clone for ChannelWriter<T> {
    fn clone(&self) -> Self {
        ChannelWriter {
            core: self.core.clone(),
        }
    }
}

impl<T> ChannelWriter<T>
where
    T: Any + Send + Sync + Clone,
{
    pub fn new(channel: &Channel<T>) -> ChannelWriter<T> {
        ChannelWriter {
            core: Arc::downgrade(&channel.core),
        }
    }

    /// Writes a message; returns false when the channel no longer exists.
    pub fn write(&self, at: &mut Transaction, data: T) -> StmResult<bool> {
        match self.core.upgrade() {
            Some(core) => {
                core.write(at, data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// [`ChannelWriter::write`] in its own transaction.
    pub fn write_atomic(&self, data: T) -> bool {
        match self.core.upgrade() {
            Some(core) => {
                atomically(|at| core.write(at, data.clone()));
                true
            }
            None => false,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.core.upgrade().is_some()
    }

    /// Renders the writer invalid.
    pub fn release(&mut self) {
        self.core = Weak::new();
    }
}

type DeadNodeQueue<T> = Rc<RefCell<VecDeque<Arc<Node<T>>>>>;

/// The read end of a channel. A reader sees the messages written after it
/// was created, each exactly once, in commit order.
///
/// Cloning a reader creates an independent reader that starts at the
/// channel's current tail — it does not inherit the source's backlog.
pub struct ChannelReader<T>
where
    T: Any + Send + Sync + Clone,
{
    cur_v: Var<Option<Arc<Node<T>>>>,
    core_v: Var<Option<Arc<ChannelCore<T>>>>,
    dead_nodes: TransactionLocalValue<DeadNodeQueue<T>>,
}

impl<T> ChannelReader<T>
where
    T: Any + Send + Sync + Clone,
{
    pub fn new(channel: &Channel<T>) -> ChannelReader<T> {
        atomically(|at| ChannelReader::new_in(channel, at))
    }

    /// Creates a reader inside a running transaction; the reader becomes
    /// effective when that transaction commits.
    pub fn new_in(channel: &Channel<T>, at: &mut Transaction) -> StmResult<ChannelReader<T>> {
        let cursor = channel.core.add_reader(at)?;
        Ok(ChannelReader {
            cur_v: Var::new(Some(cursor)),
            core_v: Var::new(Some(channel.core.clone())),
            dead_nodes: TransactionLocalValue::new(),
        })
    }

    pub fn from_read_only(
        channel: &ReadOnlyChannel<T>,
    ) -> Result<ChannelReader<T>, InvalidChannelError> {
        atomically_with_err(|at| ChannelReader::from_read_only_in(channel, at))
    }

    pub fn from_read_only_in(
        channel: &ReadOnlyChannel<T>,
        at: &mut Transaction,
    ) -> TransactionClosureResult<ChannelReader<T>, InvalidChannelError> {
        let core = channel
            .upgrade(at)?
            .ok_or(TransactionError::Abort(InvalidChannelError))?;
        let cursor = core.add_reader(at)?;
        Ok(ChannelReader {
            cur_v: Var::new(Some(cursor)),
            core_v: Var::new(Some(core)),
            dead_nodes: TransactionLocalValue::new(),
        })
    }

    fn live_core(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Arc<ChannelCore<T>>, InvalidChannelError> {
        self.core_v
            .read(at)?
            .ok_or(TransactionError::Abort(InvalidChannelError))
    }

    fn cursor(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Arc<Node<T>>, InvalidChannelError> {
        self.cur_v
            .read(at)?
            .ok_or(TransactionError::Abort(InvalidChannelError))
    }

    pub fn valid(&self, at: &mut Transaction) -> StmResult<bool> {
        Ok(self.core_v.read(at)?.is_some() && self.cur_v.read(at)?.is_some())
    }

    pub fn is_valid(&self) -> bool {
        atomically(|at| self.valid(at))
    }

    /// The next available message, without consuming it.
    pub fn peek(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Option<T>, InvalidChannelError> {
        let _core = self.live_core(at)?;
        let cursor = self.cursor(at)?;
        if cursor.initial {
            return Ok(cursor.data.clone());
        }
        Ok(cursor.next_v.read(at)?.and_then(|next| next.data.clone()))
    }

    pub fn peek_atomic(&self) -> Result<Option<T>, InvalidChannelError> {
        atomically_with_err(|at| self.peek(at))
    }

    /// Consumes and returns the next message, or `None` when the channel
    /// has nothing for this reader.
    pub fn read(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Option<T>, InvalidChannelError> {
        let _core = self.live_core(at)?;
        let cursor = self.cursor(at)?;

        if cursor.initial {
            let next = cursor.next_v.read(at)?;
            self.save_dead_node(at, &cursor);
            self.cur_v.write(at, next)?;
            return Ok(cursor.data.clone());
        }

        match cursor.next_v.read(at)? {
            Some(next) => {
                // Only a cursor that is actually advanced past goes into
                // the dead-node deque; an empty read leaves the cursor in
                // place and must not queue it.
                self.save_dead_node(at, &cursor);
                self.cur_v.write(at, Some(next.clone()))?;
                Ok(next.data.clone())
            }
            None => Ok(None),
        }
    }

    /// Consumes and returns the next message, retrying the transaction
    /// with `timeout` when there is none.
    pub fn read_retry(
        &self,
        at: &mut Transaction,
        timeout: TimeArg,
    ) -> TransactionClosureResult<T, InvalidChannelError> {
        match self.read(at)? {
            Some(data) => Ok(data),
            None => Err(TransactionError::Stm(StmError::Retry(timeout))),
        }
    }

    /// Consumes every available message.
    pub fn read_all(
        &self,
        at: &mut Transaction,
    ) -> TransactionClosureResult<Vec<T>, InvalidChannelError> {
        let mut messages = Vec::new();
        while let Some(data) = self.read(at)? {
            messages.push(data);
        }
        Ok(messages)
    }

    /// Blocks until a message is available or `timeout` passes, then
    /// consumes and returns it (`None` on timeout). Call this outside any
    /// transaction; inside one, use [`ChannelReader::read_retry`] so the
    /// blocking can reach the root transaction.
    pub fn read_atomic(&self, timeout: TimeArg) -> Result<Option<T>, InvalidChannelError> {
        let options = AtomicOptions::new().max_retry_wait(timeout);
        match atomically_with_opts_and_err(&options, |at| self.read_retry(at, TimeArg::UNLIMITED))
        {
            Ok(data) => Ok(Some(data)),
            Err(AtomicRunError::Stopped(_)) => Ok(None),
            Err(AtomicRunError::Aborted(error)) => Err(error),
        }
    }

    /// Consumes every available message in its own transaction. Runs with
    /// a conflict limit and falls back to finishing locked, so steady
    /// writers cannot starve it.
    pub fn read_all_atomic(&self) -> Result<Vec<T>, InvalidChannelError> {
        let options = AtomicOptions::new()
            .max_conflicts(MAX_READ_ALL_CONFLICTS, ConflictResolution::RunLocked);
        match atomically_with_opts_and_err(&options, |at| self.read_all(at)) {
            Ok(messages) => Ok(messages),
            Err(AtomicRunError::Aborted(error)) => Err(error),
            // Run-locked resolution cannot stop on conflicts and read_all
            // never retries.
            Err(AtomicRunError::Stopped(stop)) => {
                unreachable!("read_all stopped unexpectedly: {stop}")
            }
        }
    }

    /// Calls retry with `timeout` when no message is available.
    pub fn retry_if_empty(
        &self,
        at: &mut Transaction,
        timeout: TimeArg,
    ) -> TransactionClosureResult<(), InvalidChannelError> {
        let _core = self.live_core(at)?;
        let cursor = self.cursor(at)?;
        if cursor.initial {
            return Ok(());
        }
        if cursor.next_v.read(at)?.is_none() {
            return Err(TransactionError::Stm(StmError::Retry(timeout)));
        }
        Ok(())
    }

    /// Blocks until a message is available; false when `timeout` passed
    /// first. Call this outside any transaction; inside one, use
    /// [`ChannelReader::retry_if_empty`].
    pub fn wait(&self, timeout: TimeArg) -> Result<bool, InvalidChannelError> {
        let options = AtomicOptions::new().max_retry_wait(timeout);
        match atomically_with_opts_and_err(&options, |at| {
            self.retry_if_empty(at, TimeArg::UNLIMITED)
        }) {
            Ok(()) => Ok(true),
            Err(AtomicRunError::Stopped(_)) => Ok(false),
            Err(AtomicRunError::Aborted(error)) => Err(error),
        }
    }

    /// Detaches this reader from the channel. The unread remainder of the
    /// node chain is freed iteratively after the transaction commits; a
    /// backlog of any length cannot cascade drops through the links.
    pub fn release(&self, at: &mut Transaction) -> StmResult<()> {
        let core = match self.core_v.read(at)? {
            Some(core) => core,
            None => return Ok(()),
        };
        core.remove_reader(at)?;
        let cursor = self.cur_v.read(at)?;
        self.cur_v.write(at, None)?;
        self.core_v.write(at, None)?;

        let Some(mut node) = cursor else {
            return Ok(());
        };
        let mut chain = VecDeque::new();
        loop {
            let next = node.next_v.read(at)?;
            chain.push_back(node);
            match next {
                Some(next) => node = next,
                None => break,
            }
        }
        at.after(move || {
            let mut chain = chain;
            while chain.pop_front().is_some() {}
        });
        Ok(())
    }

    pub fn release_atomic(&self) {
        atomically(|at| self.release(at));
    }

    /// Creates an independent reader on the same channel inside a running
    /// transaction. The copy starts at the channel's current tail: it sees
    /// the messages written after it was created and does not inherit this
    /// reader's unread backlog. Copying a released reader yields a released
    /// reader.
    pub fn copy(&self, at: &mut Transaction) -> StmResult<ChannelReader<T>> {
        match self.core_v.read(at)? {
            Some(core) => {
                let cursor = core.add_reader(at)?;
                Ok(ChannelReader {
                    cur_v: Var::new(Some(cursor)),
                    core_v: Var::new(Some(core)),
                    dead_nodes: TransactionLocalValue::new(),
                })
            }
            None => Ok(ChannelReader {
                cur_v: Var::new(None),
                core_v: Var::new(None),
                dead_nodes: TransactionLocalValue::new(),
            }),
        }
    }

    /// [`ChannelReader::copy`] in its own transaction.
    pub fn copy_atomic(&self) -> ChannelReader<T> {
        atomically(|at| self.copy(at))
    }

    /// Cursors consumed in this transaction go into a transaction-local
    /// deque that an after-hook empties front to back; reading a large
    /// batch must not free the chain recursively on commit.
    fn save_dead_node(&self, at: &mut Transaction, node: &Arc<Node<T>>) {
        if let Some(queue) = self.dead_nodes.get(at) {
            queue.borrow_mut().push_back(node.clone());
            return;
        }
        let queue: DeadNodeQueue<T> = Rc::new(RefCell::new(VecDeque::new()));
        queue.borrow_mut().push_back(node.clone());
        self.dead_nodes.set(at, queue.clone());
        at.after(move || {
            let mut queue = queue.borrow_mut();
            while queue.pop_front().is_some() {}
        });
    }
}

impl<T> Clone for ChannelReader<T>
where
    T: Any + Send + Sync + Clone,
{
    fn clone(&self) -> Self {
        self.copy_atomic()
    }
}

impl<T> Drop for ChannelReader<T>
where
    T: Any + Send + Sync + Clone,
{
    fn drop(&mut self) {
        atomically(|at| self.release(at));
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;
    use crate::retry;

    #[test]
    fn fifo_per_reader() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);

        channel.write_atomic(1);
        channel.write_atomic(2);
        channel.write_atomic(3);

        assert_eq!(reader.read_all_atomic().unwrap(), [1, 2, 3]);
        assert_eq!(
            reader
                .read_atomic(TimeArg::within(Duration::ZERO))
                .unwrap(),
            None
        );
    }

    #[test]
    fn writes_in_one_transaction_deliver_contiguously() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);

        atomically(|at| {
            channel.write(at, 10)?;
            channel.write(at, 11)?;
            channel.write(at, 12)
        });

        assert_eq!(reader.read_all_atomic().unwrap(), [10, 11, 12]);
    }

    #[test]
    fn every_reader_sees_every_message() {
        let channel = Channel::new();
        let first = ChannelReader::new(&channel);
        let second = ChannelReader::new(&channel);

        channel.write_atomic("msg");

        assert_eq!(first.read_all_atomic().unwrap(), ["msg"]);
        assert_eq!(second.read_all_atomic().unwrap(), ["msg"]);
    }

    #[test]
    fn messages_before_the_reader_existed_are_not_seen() {
        let channel = Channel::new();
        let keeper = ChannelReader::new(&channel);
        channel.write_atomic(1);

        let late = ChannelReader::new(&channel);
        channel.write_atomic(2);

        assert_eq!(late.read_all_atomic().unwrap(), [2]);
        assert_eq!(keeper.read_all_atomic().unwrap(), [1, 2]);
    }

    #[test]
    fn writes_without_readers_are_discarded() {
        let channel = Channel::new();
        channel.write_atomic(1);

        let reader = ChannelReader::new(&channel);
        assert_eq!(reader.read_all_atomic().unwrap(), Vec::<i32>::new());

        channel.write_atomic(2);
        assert_eq!(reader.read_all_atomic().unwrap(), [2]);
    }

    #[test]
    fn peek_does_not_consume() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        channel.write_atomic(5);

        assert_eq!(reader.peek_atomic().unwrap(), Some(5));
        assert_eq!(reader.peek_atomic().unwrap(), Some(5));
        assert_eq!(reader.read_all_atomic().unwrap(), [5]);
        assert_eq!(reader.peek_atomic().unwrap(), None);
    }

    #[test]
    fn reader_init_delivers_one_initial_message() {
        let seed = Var::new(100);
        let seed_for_init = seed.clone();
        let channel = Channel::with_reader_init(move |at| seed_for_init.read(at));

        let reader = ChannelReader::new(&channel);
        channel.write_atomic(1);

        // The synthesized message comes first, then the regular traffic.
        assert_eq!(reader.read_all_atomic().unwrap(), [100, 1]);

        // Only the creating reader sees its own initial message.
        let other = ChannelReader::new(&channel);
        channel.write_atomic(2);
        assert_eq!(other.read_all_atomic().unwrap(), [100, 2]);
        assert_eq!(reader.read_all_atomic().unwrap(), [2]);
    }

    #[test]
    fn initial_message_counts_as_available() {
        let channel = Channel::with_reader_init(|_| Ok(0));
        let reader = ChannelReader::new(&channel);
        assert!(reader.wait(TimeArg::within(Duration::from_millis(5))).unwrap());
        assert_eq!(reader.peek_atomic().unwrap(), Some(0));
    }

    #[test]
    fn read_blocks_until_write() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        let writer = ChannelWriter::new(&channel);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            assert!(writer.write_atomic(7));
        });

        assert_eq!(reader.read_atomic(TimeArg::UNLIMITED).unwrap(), Some(7));
        handle.join().unwrap();
    }

    #[test]
    fn wait_times_out_on_silence() {
        let channel: Channel<i32> = Channel::new();
        let reader = ChannelReader::new(&channel);
        assert!(!reader
            .wait(TimeArg::within(Duration::from_millis(10)))
            .unwrap());
    }

    #[test]
    fn released_reader_is_invalid_and_stops_counting() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        reader.release_atomic();

        assert!(!reader.is_valid());
        assert!(reader.read_all_atomic().is_err());

        // With the only reader gone, writes are discarded again.
        channel.write_atomic(1);
        let fresh = ChannelReader::new(&channel);
        assert_eq!(fresh.read_all_atomic().unwrap(), Vec::<i32>::new());
    }

    #[test]
    fn releasing_a_long_backlog_does_not_overflow() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        for i in 0..100_000 {
            channel.write_atomic(i);
        }
        drop(reader);
    }

    #[test]
    fn reading_a_long_backlog_does_not_overflow() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        for i in 0..100_000 {
            channel.write_atomic(i);
        }
        assert_eq!(reader.read_all_atomic().unwrap().len(), 100_000);
    }

    #[test]
    fn writer_outlives_channel_gracefully() {
        let channel = Channel::new();
        let writer = ChannelWriter::new(&channel);
        let reader = ChannelReader::new(&channel);
        drop(channel);

        // Readers keep the channel alive.
        assert!(writer.is_valid());
        assert!(writer.write_atomic(1));
        assert_eq!(reader.read_all_atomic().unwrap(), [1]);

        drop(reader);
        assert!(!writer.is_valid());
        assert!(!writer.write_atomic(2));
    }

    #[test]
    fn read_only_channel_handles() {
        let channel = Channel::new();
        let view = ReadOnlyChannel::new(&channel);
        assert!(view.is_valid());

        let reader = ChannelReader::from_read_only(&view).unwrap();
        channel.write_atomic(3);
        assert_eq!(reader.read_all_atomic().unwrap(), [3]);

        view.release_atomic();
        assert!(!view.is_valid());
        assert!(ChannelReader::from_read_only(&view).is_err());
        assert!(view.connect_to_write_signal(|| ()).is_err());
    }

    #[test]
    fn write_signal_fires_after_commit() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        let hits = Arc::new(AtomicUsize::new(0));

        let hits_in_signal = hits.clone();
        let mut connection = channel.connect_to_write_signal(move || {
            hits_in_signal.fetch_add(1, Ordering::SeqCst);
        });

        channel.write_atomic(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Two writes in one transaction signal twice, after the commit.
        atomically(|at| {
            channel.write(at, 2)?;
            channel.write(at, 3)
        });
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        connection.disconnect();
        channel.write_atomic(4);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        drop(reader);
    }

    #[test]
    fn cloned_reader_starts_at_the_tail() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        channel.write_atomic(1);

        let late = reader.clone();
        channel.write_atomic(2);

        assert_eq!(late.read_all_atomic().unwrap(), [2]);
        assert_eq!(reader.read_all_atomic().unwrap(), [1, 2]);
    }

    #[test]
    fn copy_participates_in_the_enclosing_transaction() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);

        // The copy and the write commit together; the copy's cursor sits
        // before the message written in the same transaction.
        let copy = atomically(|at| {
            let copy = reader.copy(at)?;
            channel.write(at, 5)?;
            Ok(copy)
        });

        assert_eq!(copy.read_all_atomic().unwrap(), [5]);
        assert_eq!(reader.read_all_atomic().unwrap(), [5]);

        // Copying a released reader yields a released reader.
        reader.release_atomic();
        let dead = reader.copy_atomic();
        assert!(!dead.is_valid());
    }

    #[test]
    fn releasing_a_reader_inside_a_transaction_nests() {
        let channel: Channel<i32> = Channel::new();
        let outer = ChannelReader::new(&channel);
        let extra = ChannelReader::new(&channel);

        atomically(|at| {
            assert_eq!(channel.core.num_readers_v.read(at)?, 2);
            // Runs its own atomically, which nests as a sub-transaction
            // and merges its effects into this one.
            extra.release_atomic();
            assert_eq!(channel.core.num_readers_v.read(at)?, 1);
            Ok(())
        });

        assert!(!extra.is_valid());
        assert!(outer.is_valid());
    }

    #[test]
    fn read_retry_wakes_on_write() {
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);
        let channel_writer = ChannelWriter::new(&channel);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel_writer.write_atomic(9);
        });

        let got = atomically_with_err(|at| reader.read_retry(at, TimeArg::UNLIMITED));
        assert_eq!(got.unwrap(), 9);
        handle.join().unwrap();
    }

    #[test]
    fn retrying_read_does_not_lose_the_retry() {
        // A read that retries must leave the channel untouched.
        let channel = Channel::new();
        let reader = ChannelReader::new(&channel);

        assert_eq!(
            reader.read_atomic(TimeArg::within(Duration::from_millis(5))).unwrap(),
            None
        );
        channel.write_atomic(1);
        assert_eq!(reader.read_all_atomic().unwrap(), [1]);
    }

    #[test]
    fn retry_signal_composes_with_reader_ops() {
        // retry() composes with reader ops through `?`.
        let channel: Channel<i32> = Channel::new();
        let reader = ChannelReader::new(&channel);
        let channel_writer = ChannelWriter::new(&channel);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            channel_writer.write_atomic(4);
        });

        let got: i32 = atomically_with_err(|at| match reader.read(at)? {
            Some(v) => Ok(v),
            None => Err(TransactionError::from(retry::<i32>().unwrap_err())),
        })
        .unwrap();
        assert_eq!(got, 4);
        handle.join().unwrap();
    }
}
