//! Transport traits
//!
//! The master does not talk to CAN hardware itself. It is handed a sender and a receiver
//! implementing these traits when the network is connected.

use crate::messages::CanMessage;

/// An async CAN sender trait
pub trait AsyncCanSender: Send + 'static {
    /// Error type returned by sender
    type Error: CanSendError;
    /// Send a message to the bus
    fn send(
        &mut self,
        msg: CanMessage,
    ) -> impl core::future::Future<Output = Result<(), Self::Error>> + Send;
}

/// A trait for CAN errors which may come from different types of interfaces
///
/// On no_std, all the error can do is return the unsent frame. With `std`, it can convert any
/// underlying errors into a String.
pub trait CanSendError: core::fmt::Debug + Send {
    /// Convert the error into the undelivered message
    fn into_can_message(self) -> CanMessage;

    /// Get a string describing the error
    #[cfg(feature = "std")]
    #[cfg_attr(docsrs, doc(cfg(feature = "std")))]
    fn message(&self) -> String;
}

/// Transports with no further error detail return the undelivered frame
impl CanSendError for CanMessage {
    fn into_can_message(self) -> CanMessage {
        self
    }

    #[cfg(feature = "std")]
    fn message(&self) -> String {
        format!("failed to send frame with id {}", self.id)
    }
}

/// An async CAN receiver trait
pub trait AsyncCanReceiver: Send + 'static {
    /// The error type returned by recv
    type Error: core::fmt::Debug + Send;

    /// Receive available message immediately
    fn try_recv(&mut self) -> Option<CanMessage>;

    /// A blocking receive
    fn recv(
        &mut self,
    ) -> impl core::future::Future<Output = Result<CanMessage, Self::Error>> + Send;

    /// Remove any pending messages from the receiver
    fn flush(&mut self) {
        while self.try_recv().is_some() {}
    }
}
