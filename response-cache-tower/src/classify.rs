use std::error::Error as StdError;

/// Classification of body copy and streaming failures, used to pick the
/// log level: a client that went away is routine, everything else is not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyErrorClass {
    /// The client disconnected: connection resets, broken pipes, exceeded
    /// deadlines and closed HTTP/2 streams.
    ClientDisconnect,
    /// A body was written for a status or method that does not allow one.
    BodyNotAllowed,
    /// Anything else.
    Other,
}

/// Classifies a body copy error by walking its source chain for known
/// I/O conditions, falling back to the transport libraries' message
/// markers (hyper and h2 do not expose typed stream errors).
pub fn classify_copy_error(
    err: &(dyn StdError + 'static),
) -> CopyErrorClass {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            match io.kind() {
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::TimedOut => {
                    return CopyErrorClass::ClientDisconnect
                }
                _ => {}
            }
        }
        current = e.source();
    }
    let message = err.to_string().to_ascii_lowercase();
    if message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("stream closed")
        || message.contains("stream no longer needed")
        || message.contains("deadline has elapsed")
    {
        return CopyErrorClass::ClientDisconnect;
    }
    if message.contains("body not allowed") {
        return CopyErrorClass::BodyNotAllowed;
    }
    CopyErrorClass::Other
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn io_disconnects_are_recognized() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::ConnectionAborted,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::TimedOut,
        ] {
            let err = io::Error::new(kind, "boom");
            assert_eq!(
                classify_copy_error(&err),
                CopyErrorClass::ClientDisconnect
            );
        }
    }

    #[test]
    fn nested_io_errors_are_found_through_the_chain() {
        let inner = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        // A plain boxed string has no source; the marker fallback applies.
        let outer: Box<dyn StdError + Send + Sync> = "write failed".into();
        assert_eq!(classify_copy_error(&*outer), CopyErrorClass::Other);

        #[derive(Debug)]
        struct Wrap(io::Error);
        impl std::fmt::Display for Wrap {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "wrapped")
            }
        }
        impl StdError for Wrap {
            fn source(&self) -> Option<&(dyn StdError + 'static)> {
                Some(&self.0)
            }
        }
        assert_eq!(
            classify_copy_error(&Wrap(inner)),
            CopyErrorClass::ClientDisconnect
        );
    }

    #[test]
    fn message_markers_are_recognized() {
        let err: Box<dyn StdError + Send + Sync> =
            "http2 error: stream closed because of a broken pipe".into();
        assert_eq!(
            classify_copy_error(&*err),
            CopyErrorClass::ClientDisconnect
        );
        let err: Box<dyn StdError + Send + Sync> =
            "http: body not allowed for this method".into();
        assert_eq!(classify_copy_error(&*err), CopyErrorClass::BodyNotAllowed);
        let err: Box<dyn StdError + Send + Sync> = "disk full".into();
        assert_eq!(classify_copy_error(&*err), CopyErrorClass::Other);
    }
}
