//! Typed worker messages.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request kind the worker process can answer.
///
/// `PATTERN` is the dispatch tag on the wire and must be unique per host.
pub trait WorkerMessage: Send + 'static {
    const PATTERN: &'static str;

    type Data: Serialize + DeserializeOwned + Send + 'static;
    type Response: Serialize + DeserializeOwned + Send + 'static;

    fn new(data: Self::Data) -> Self;

    fn data(&self) -> &Self::Data;

    fn into_data(self) -> Self::Data;
}

/// Declare a [`WorkerMessage`] as a newtype over its payload.
///
/// ```rust,ignore
/// worker_message! {
///     /// Render a thumbnail.
///     #[derive(Debug, Clone)]
///     pub struct RenderThumbnail(ThumbnailRequest) -> ThumbnailReply = "media.thumbnail";
/// }
/// ```
#[macro_export]
macro_rules! worker_message {
    ($(#[$meta:meta])* $vis:vis struct $name:ident($data:ty) -> $response:ty = $pattern:literal;) => {
        $(#[$meta])*
        $vis struct $name(pub $data);

        impl $crate::bridge::WorkerMessage for $name {
            const PATTERN: &'static str = $pattern;

            type Data = $data;
            type Response = $response;

            fn new(data: Self::Data) -> Self {
                Self(data)
            }

            fn data(&self) -> &Self::Data {
                &self.0
            }

            fn into_data(self) -> Self::Data {
                self.0
            }
        }
    };
}
