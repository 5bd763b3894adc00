// Decode thread with a single-slot mailbox
//
// Runs a frame source on its own thread. Frames are moved to the render thread
// through a bounded channel of capacity 1, so at most one decoded frame waits
// for the renderer. When the slot is full the decode side either blocks
// (pacing) or releases the new frame straight away. Frames the renderer is
// done with travel back over a second channel and are released by the wrapped
// source on the decode thread.

use super::{DecoderError, FramePixelFormat, FramePoll, FrameSource, HwFrame};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, SendTimeoutError, Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// What the decode thread does when the mailbox is still occupied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backpressure {
    /// Wait for the renderer to take the previous frame
    #[default]
    Block,
    /// Release the new frame and keep decoding
    DropNewest,
}

enum Message<F> {
    Frame(F),
    Failed(DecoderError),
    EndOfStream,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub frames_returned: u64,
    pub errors: u64,
}

/// Frame source whose decoding happens on a dedicated thread
pub struct MailboxSource<F> {
    rx: Receiver<Message<F>>,
    /// Unbounded so the render thread never waits on a decode thread that is
    /// itself blocked on the mailbox
    returns: Option<Sender<F>>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<MailboxStats>>,
    worker: Option<JoinHandle<()>>,
    output_format: FramePixelFormat,
    wait: Duration,
    finished: bool,
}

impl<F: HwFrame + Send + 'static> MailboxSource<F> {
    /// Spawn the decode thread. `build` runs on that thread, so the source
    /// itself does not need to be `Send`.
    pub fn spawn<S, B>(
        output_format: FramePixelFormat,
        policy: Backpressure,
        wait: Duration,
        build: B,
    ) -> Result<Self, DecoderError>
    where
        S: FrameSource<Frame = F>,
        B: FnOnce() -> Result<S, DecoderError> + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let (returns, returned) = crossbeam_channel::unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(Mutex::new(MailboxStats::default()));

        let worker = {
            let stop = stop.clone();
            let stats = stats.clone();
            let channels = DecodeChannels {
                tx,
                unclaimed: rx.clone(),
                returned,
            };
            std::thread::Builder::new()
                .name("decode".to_string())
                .spawn(move || decode_loop(build, channels, stop, stats, policy, wait))
                .map_err(|e| DecoderError::InitError(format!("Failed to spawn decode thread: {}", e)))?
        };

        log::info!("Decode thread spawned ({:?} backpressure)", policy);

        Ok(Self {
            rx,
            returns: Some(returns),
            stop,
            stats,
            worker: Some(worker),
            output_format,
            wait,
            finished: false,
        })
    }

    pub fn stats(&self) -> MailboxStats {
        *self.stats.lock()
    }
}

/// Decode thread's ends of the mailbox and the return channel
struct DecodeChannels<F> {
    tx: Sender<Message<F>>,
    /// Reads back whatever the renderer left in the mailbox at shutdown
    unclaimed: Receiver<Message<F>>,
    returned: Receiver<F>,
}

fn decode_loop<S, B>(
    build: B,
    channels: DecodeChannels<S::Frame>,
    stop: Arc<AtomicBool>,
    stats: Arc<Mutex<MailboxStats>>,
    policy: Backpressure,
    wait: Duration,
) where
    S: FrameSource,
    B: FnOnce() -> Result<S, DecoderError>,
{
    let DecodeChannels {
        tx,
        unclaimed,
        returned,
    } = channels;

    let mut source = match build() {
        Ok(source) => source,
        Err(e) => {
            log::error!("Failed to create frame source: {}", e);
            let _ = tx.send(Message::Failed(e));
            return;
        }
    };

    log::info!("Decode thread running: {}", source.info());

    while !stop.load(Ordering::Relaxed) {
        drain_returned(&returned, &mut source, &stats);

        match source.receive_frame() {
            Ok(FramePoll::Ready(frame)) => match policy {
                Backpressure::Block => {
                    let sent = send_until_stopped(&tx, Message::Frame(frame), &stop, wait, || {
                        drain_returned(&returned, &mut source, &stats)
                    });
                    match sent {
                        Ok(()) => stats.lock().frames_sent += 1,
                        Err(Message::Frame(frame)) => {
                            source.release(frame);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                Backpressure::DropNewest => match tx.try_send(Message::Frame(frame)) {
                    Ok(()) => stats.lock().frames_sent += 1,
                    Err(TrySendError::Full(Message::Frame(frame))) => {
                        log::trace!("Mailbox full, dropping frame");
                        source.release(frame);
                        stats.lock().frames_dropped += 1;
                    }
                    Err(TrySendError::Full(_)) => {}
                    Err(TrySendError::Disconnected(Message::Frame(frame))) => {
                        source.release(frame);
                        break;
                    }
                    Err(TrySendError::Disconnected(_)) => break,
                },
            },
            Ok(FramePoll::NotYetAvailable) => {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
            }
            Ok(FramePoll::EndOfStream) => {
                let _ = send_until_stopped(&tx, Message::EndOfStream, &stop, wait, || {
                    drain_returned(&returned, &mut source, &stats)
                });
                break;
            }
            Err(e) => {
                stats.lock().errors += 1;
                let fatal = !e.is_recoverable();
                let sent = send_until_stopped(&tx, Message::Failed(e), &stop, wait, || {
                    drain_returned(&returned, &mut source, &stats)
                });
                if sent.is_err() || fatal {
                    break;
                }
            }
        }
    }

    // Frames the renderer still holds come back until the mailbox is dropped;
    // after that nobody reads the slot, so a frame parked there is ours again
    for frame in returned.iter() {
        give_back(&mut source, &stats, frame);
    }
    for message in unclaimed.try_iter() {
        if let Message::Frame(frame) = message {
            source.release(frame);
        }
    }

    log::debug!("Decode thread exiting");
}

/// Blocking send that hands the message back once `stop` is raised.
/// `idle` runs every `wait` while the mailbox stays full.
fn send_until_stopped<F>(
    tx: &Sender<Message<F>>,
    mut message: Message<F>,
    stop: &AtomicBool,
    wait: Duration,
    mut idle: impl FnMut(),
) -> Result<(), Message<F>> {
    let wait = wait.max(Duration::from_millis(1));
    loop {
        match tx.send_timeout(message, wait) {
            Ok(()) => return Ok(()),
            Err(SendTimeoutError::Timeout(returned)) if !stop.load(Ordering::Relaxed) => {
                idle();
                message = returned;
            }
            Err(SendTimeoutError::Timeout(returned)) | Err(SendTimeoutError::Disconnected(returned)) => {
                return Err(returned);
            }
        }
    }
}

fn give_back<S: FrameSource>(source: &mut S, stats: &Mutex<MailboxStats>, frame: S::Frame) {
    source.release(frame);
    stats.lock().frames_returned += 1;
}

fn drain_returned<S: FrameSource>(returned: &Receiver<S::Frame>, source: &mut S, stats: &Mutex<MailboxStats>) {
    for frame in returned.try_iter() {
        give_back(source, stats, frame);
    }
}

impl<F: HwFrame> FrameSource for MailboxSource<F> {
    type Frame = F;

    fn output_format(&self) -> FramePixelFormat {
        self.output_format.clone()
    }

    fn receive_frame(&mut self) -> Result<FramePoll<F>, DecoderError> {
        if self.finished {
            return Ok(FramePoll::EndOfStream);
        }

        match self.rx.recv_timeout(self.wait) {
            Ok(Message::Frame(frame)) => Ok(FramePoll::Ready(frame)),
            Ok(Message::Failed(e)) => Err(e),
            Ok(Message::EndOfStream) => {
                self.finished = true;
                Ok(FramePoll::EndOfStream)
            }
            Err(RecvTimeoutError::Timeout) => Ok(FramePoll::NotYetAvailable),
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Decode thread exited without end of stream");
                self.finished = true;
                Ok(FramePoll::EndOfStream)
            }
        }
    }

    /// Send the frame back so the wrapped source releases it on its own thread
    fn release(&mut self, frame: F) {
        if let Some(returns) = &self.returns {
            if let Err(SendError(frame)) = returns.send(frame) {
                log::warn!("Decode thread gone, dropping returned frame");
                drop(frame);
            }
        }
    }

    fn blocks_on_receive(&self) -> bool {
        !self.wait.is_zero()
    }

    fn info(&self) -> &str {
        "Mailbox (decode thread)"
    }
}

impl<F> Drop for MailboxSource<F> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        // Ends the decode thread's final wait for returned frames
        self.returns = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Decode thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{Event, Journal, ScriptedFrame, ScriptedSource, Step};
    use std::time::Instant;

    fn wait_until(mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for decode thread");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn next_ready(mailbox: &mut MailboxSource<ScriptedFrame>) -> ScriptedFrame {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match mailbox.receive_frame().unwrap() {
                FramePoll::Ready(frame) => return frame,
                FramePoll::NotYetAvailable => assert!(Instant::now() < deadline),
                FramePoll::EndOfStream => panic!("unexpected end of stream"),
            }
        }
    }

    fn next_terminal(mailbox: &mut MailboxSource<ScriptedFrame>) -> Result<(), DecoderError> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            match mailbox.receive_frame()? {
                FramePoll::EndOfStream => return Ok(()),
                FramePoll::NotYetAvailable => assert!(Instant::now() < deadline),
                FramePoll::Ready(frame) => panic!("unexpected frame {}", frame.seq),
            }
        }
    }

    #[test]
    fn test_frames_arrive_in_order() {
        let journal = Journal::default();
        let source_journal = journal.clone();
        let mut mailbox = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::Block,
            Duration::from_millis(5),
            move || {
                Ok(ScriptedSource::new(
                    source_journal,
                    vec![
                        Step::Frame(ScriptedFrame::linear(0, 64, 64)),
                        Step::NotYet,
                        Step::Frame(ScriptedFrame::linear(1, 64, 64)),
                        Step::Frame(ScriptedFrame::linear(2, 64, 64)),
                    ],
                ))
            },
        )
        .unwrap();

        for seq in 0..3 {
            assert_eq!(next_ready(&mut mailbox).seq, seq);
        }
        next_terminal(&mut mailbox).unwrap();
        assert!(matches!(mailbox.receive_frame(), Ok(FramePoll::EndOfStream)));
        assert_eq!(mailbox.stats().frames_sent, 3);
        assert_eq!(mailbox.stats().frames_dropped, 0);
    }

    #[test]
    fn test_build_failure_is_reported() {
        let mut mailbox = MailboxSource::<ScriptedFrame>::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::Block,
            Duration::from_millis(5),
            || -> Result<ScriptedSource, DecoderError> {
                Err(DecoderError::HardwareNotAvailable("no device".to_string()))
            },
        )
        .unwrap();

        let err = next_terminal(&mut mailbox).unwrap_err();
        assert!(matches!(err, DecoderError::HardwareNotAvailable(_)));
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_recoverable_error_keeps_thread_running() {
        let journal = Journal::default();
        let source_journal = journal.clone();
        let mut mailbox = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::Block,
            Duration::from_millis(5),
            move || {
                Ok(ScriptedSource::new(
                    source_journal,
                    vec![
                        Step::Fail(DecoderError::DecodeError("corrupt slice".to_string())),
                        Step::Frame(ScriptedFrame::linear(7, 64, 64)),
                    ],
                ))
            },
        )
        .unwrap();

        let err = loop {
            match mailbox.receive_frame() {
                Err(e) => break e,
                Ok(FramePoll::NotYetAvailable) => continue,
                Ok(_) => panic!("expected the scripted decode error first"),
            }
        };
        assert!(err.is_recoverable());
        assert_eq!(next_ready(&mut mailbox).seq, 7);
        next_terminal(&mut mailbox).unwrap();
    }

    #[test]
    fn test_drop_newest_releases_frames_when_full() {
        let journal = Journal::default();
        let source_journal = journal.clone();
        let mut mailbox = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::DropNewest,
            Duration::from_millis(5),
            move || {
                Ok(ScriptedSource::new(
                    source_journal,
                    (0..5)
                        .map(|seq| Step::Frame(ScriptedFrame::linear(seq, 64, 64)))
                        .collect(),
                ))
            },
        )
        .unwrap();

        wait_until(|| {
            let stats = mailbox.stats();
            stats.frames_sent + stats.frames_dropped == 5
        });
        assert_eq!(mailbox.stats().frames_sent, 1);
        assert_eq!(mailbox.stats().frames_dropped, 4);

        // Dropped frames went back to the source on the decode thread
        let released: Vec<Event> = journal.events();
        assert_eq!(released.len(), 4);
        assert!(released.contains(&Event::Released(4)));

        assert_eq!(next_ready(&mut mailbox).seq, 0);
        next_terminal(&mut mailbox).unwrap();
    }

    #[test]
    fn test_drop_stops_blocked_thread() {
        let journal = Journal::default();
        let source_journal = journal.clone();
        let mailbox = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::Block,
            Duration::from_millis(5),
            move || {
                Ok(ScriptedSource::new(
                    source_journal,
                    (0..3)
                        .map(|seq| Step::Frame(ScriptedFrame::linear(seq, 64, 64)))
                        .collect(),
                ))
            },
        )
        .unwrap();

        wait_until(|| mailbox.stats().frames_sent == 1);
        // Joins the thread; must not hang on the second, blocked send
        drop(mailbox);

        // The parked frame went back to the source, as did the blocked one
        // if it was decoded before the stop
        assert_eq!(journal.count(|e| *e == Event::Released(0)), 1);
        assert_eq!(journal.count(|e| *e == Event::Released(2)), 0);
    }

    #[test]
    fn test_released_frames_return_to_source() {
        let journal = Journal::default();
        let source_journal = journal.clone();
        let mut mailbox = MailboxSource::spawn(
            FramePixelFormat::DrmPrime,
            Backpressure::Block,
            Duration::from_millis(5),
            move || {
                Ok(ScriptedSource::new(
                    source_journal,
                    (0..2)
                        .map(|seq| Step::Frame(ScriptedFrame::linear(seq, 64, 64)))
                        .collect(),
                ))
            },
        )
        .unwrap();
        assert!(mailbox.blocks_on_receive());

        let first = next_ready(&mut mailbox);
        mailbox.release(first);
        wait_until(|| mailbox.stats().frames_returned == 1);
        assert_eq!(journal.events(), vec![Event::Released(0)]);

        // Held past end of stream, released before the thread exits
        let second = next_ready(&mut mailbox);
        next_terminal(&mut mailbox).unwrap();
        mailbox.release(second);
        drop(mailbox);
        assert_eq!(journal.events(), vec![Event::Released(0), Event::Released(1)]);
    }
}
