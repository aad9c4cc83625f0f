//! The byte boundary between the monitor and the outside world.
//!
//! Two physical transports exist: a classic byte-stream style link
//! carrying CR/LF-framed ASCII (serial or the TCP port of a Wi-Fi
//! adapter), and a BLE link where each characteristic notification is one
//! packet. Both are unified behind the [`Adapter`]/[`Link`] pair; the only
//! per-transport difference visible downstream is the frame [`Codec`].

pub mod ble;
pub mod stream;

use crate::error::Result;
use crate::frame::Codec;
use async_trait::async_trait;

/// Factory side of a transport: availability probe plus connection.
///
/// Discovery and pairing UX live outside this crate; an adapter only needs
/// to turn a target name into a live link.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Whether the underlying stack is present and enabled.
    async fn is_available(&self) -> bool;

    /// Open an exclusive link to the named target.
    async fn connect(&self, target: &str) -> Result<Box<dyn Link>>;
}

/// One connected, exclusively-owned link.
#[async_trait]
pub trait Link: Send {
    /// Transmit one command. Resolution means the transport accepted the
    /// bytes, not that the device answered.
    async fn send(&mut self, bytes: &[u8]) -> Result<()>;

    /// The next incoming frame, as delimited by the transport's own
    /// framing. `None` means the link closed. Cancel-safe.
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;

    /// Wire encoding of this link's frames.
    fn codec(&self) -> Codec;

    /// Release the link. Idempotent.
    async fn close(&mut self);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use crate::error::Error;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Channel-backed [`Link`] for driving the monitor without hardware.
    ///
    /// Everything sent by the code under test shows up on
    /// [`MockRemote::sent_rx`]; frames pushed into
    /// [`MockRemote::frame_tx`] come out of [`Link::recv`]. Dropping
    /// `frame_tx` closes the link (unsolicited disconnect); dropping
    /// `sent_rx` makes sends fail.
    pub struct MockLink {
        codec: Codec,
        sent_tx: mpsc::UnboundedSender<Vec<u8>>,
        frame_rx: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
    }

    pub struct MockRemote {
        pub sent_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        pub frame_tx: mpsc::UnboundedSender<Result<Vec<u8>>>,
    }

    pub fn mock_link(codec: Codec) -> (MockLink, MockRemote) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        (
            MockLink {
                codec,
                sent_tx,
                frame_rx,
            },
            MockRemote { sent_rx, frame_tx },
        )
    }

    #[async_trait]
    impl Link for MockLink {
        async fn send(&mut self, bytes: &[u8]) -> Result<()> {
            self.sent_tx
                .send(bytes.to_vec())
                .map_err(|_| Error::Transport("mock link torn down".into()))
        }

        async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
            self.frame_rx.recv().await
        }

        fn codec(&self) -> Codec {
            self.codec
        }

        async fn close(&mut self) {
            self.frame_rx.close();
        }
    }

    /// Adapter handing out one prepared [`MockLink`], or failing when
    /// none is loaded.
    pub struct MockAdapter {
        link: Mutex<Option<MockLink>>,
    }

    impl MockAdapter {
        pub fn with_link(link: MockLink) -> Self {
            Self {
                link: Mutex::new(Some(link)),
            }
        }

        pub fn empty() -> Self {
            Self {
                link: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl Adapter for MockAdapter {
        async fn is_available(&self) -> bool {
            true
        }

        async fn connect(&self, _target: &str) -> Result<Box<dyn Link>> {
            match self.link.lock().unwrap().take() {
                Some(link) => Ok(Box::new(link)),
                None => Err(Error::Transport("no device in range".into())),
            }
        }
    }
}
