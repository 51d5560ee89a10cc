//! Abstract programmer transport interface.
use std::io;
use std::thread::sleep;

use scroll::{Pread, LE};

use crate::constants::{RetryPolicy, FRAME_HEADER_SIZE};
use crate::error::{Error, Result, TransportFailure};
use crate::protocol::{crc8, encode_frame, Command, Response, Status};

pub use self::serial::SerialTransport;

mod serial;

/// Abstraction of the byte link to the programmer.
/// Usually a USB CDC serial port.
pub trait Transport {
    /// Discard anything already waiting on the input side.
    fn clear_input(&mut self) -> io::Result<()>;
    fn send_raw(&mut self, raw: &[u8]) -> io::Result<()>;
    /// Fill `buf` until it is full or the read timeout expires.
    /// Returns the number of bytes received.
    fn recv_raw(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn recv_exact(&mut self, buf: &mut [u8]) -> std::result::Result<(), TransportFailure> {
        let received = self
            .recv_raw(buf)
            .map_err(|e| TransportFailure::Io(e.to_string()))?;
        match received {
            n if n == buf.len() => Ok(()),
            0 => Err(TransportFailure::Timeout),
            received => Err(TransportFailure::ShortRead {
                expected: buf.len(),
                received,
            }),
        }
    }

    /// One request/response round trip, no retry.
    fn attempt(&mut self, request: &[u8]) -> std::result::Result<Response, TransportFailure> {
        // NOTE: a late response to a previous attempt is dropped here too.
        self.clear_input()
            .map_err(|e| TransportFailure::Io(e.to_string()))?;
        self.send_raw(request)
            .map_err(|e| TransportFailure::WriteError(e.to_string()))?;

        let mut frame = vec![0u8; FRAME_HEADER_SIZE];
        self.recv_exact(&mut frame)?;
        let len = frame
            .pread_with::<u16>(1, LE)
            .map_err(|e| TransportFailure::Io(e.to_string()))? as usize;
        if len > 0 {
            frame.resize(FRAME_HEADER_SIZE + len, 0);
            self.recv_exact(&mut frame[FRAME_HEADER_SIZE..])?;
        }
        let mut crc = [0u8; 1];
        self.recv_exact(&mut crc)?;

        let expected = crc8(&frame);
        if crc[0] != expected {
            return Err(TransportFailure::ChecksumMismatch {
                expected,
                received: crc[0],
            });
        }
        Ok(Response {
            status: Status::from(frame[0]),
            payload: frame.split_off(FRAME_HEADER_SIZE),
        })
    }

    /// Send `cmd` and wait for its response, retrying failed attempts.
    ///
    /// A response with a non-OK status is still a successful exchange.
    fn exchange(&mut self, cmd: &Command, retry: RetryPolicy) -> Result<Response> {
        self.exchange_until(cmd, retry, &|| false)
    }

    /// Like [`exchange`](Self::exchange), but `cancelled` is polled before
    /// every attempt. Once it returns true no further frame is sent.
    fn exchange_until(
        &mut self,
        cmd: &Command,
        retry: RetryPolicy,
        cancelled: &dyn Fn() -> bool,
    ) -> Result<Response> {
        let req = encode_frame(cmd.opcode(), &cmd.payload()?)?;
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            if cancelled() {
                return Err(Error::Cancelled);
            }
            log::debug!("=> {}", hex::encode(&req));
            match self.attempt(&req) {
                Ok(resp) => {
                    log::debug!("<= {:?}", resp);
                    return Ok(resp);
                }
                Err(_) if cancelled() => return Err(Error::Cancelled),
                Err(failure) if attempt < attempts => {
                    log::warn!(
                        "command 0x{:02X} attempt {}/{} failed: {}, retrying",
                        cmd.opcode(),
                        attempt,
                        attempts,
                        failure
                    );
                    sleep(retry.backoff);
                    attempt += 1;
                }
                Err(failure) => {
                    return Err(Error::Transport {
                        failure,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::cell::Cell;
    use std::rc::Rc;
    use std::time::Duration;

    use super::mock::{MockTransport, Reply};
    use super::*;

    const FAST: RetryPolicy = RetryPolicy {
        attempts: 3,
        backoff: Duration::ZERO,
    };

    fn ok_frame(payload: &[u8]) -> Vec<u8> {
        encode_frame(0x00, payload).unwrap()
    }

    #[test]
    fn exchange_returns_status_and_payload() {
        let mut t = MockTransport::new([Reply::Bytes(ok_frame(b"picokit 1.0"))]);
        let resp = t.exchange(&Command::Version, FAST).unwrap();
        assert!(resp.is_ok());
        assert_eq!(resp.payload(), b"picokit 1.0");
        assert_eq!(t.sent, vec![vec![0x09, 0x00, 0x00, crc8(&[0x09, 0, 0])]]);
        assert_eq!(t.clears, 1);
    }

    #[test]
    fn device_status_is_not_retried() {
        let mut t = MockTransport::new([
            Reply::Bytes(encode_frame(0x03, &[]).unwrap()),
            Reply::Bytes(ok_frame(&[])),
        ]);
        let resp = t.exchange(&Command::Erase, FAST).unwrap();
        assert_eq!(resp.status, Status::NoTarget);
        assert_eq!(t.sent.len(), 1);
    }

    #[test]
    fn retry_exhaustion_makes_exactly_n_attempts() {
        let mut t = MockTransport::default();
        let err = t.exchange(&Command::Diagnose, FAST).unwrap_err();
        assert_eq!(t.sent.len(), 3);
        match err {
            Error::Transport { failure, attempts } => {
                assert_eq!(failure, TransportFailure::Timeout);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn success_on_second_attempt_stops_retrying() {
        let mut t = MockTransport::new([
            Reply::Bytes(vec![]),
            Reply::Bytes(ok_frame(&[0xAB])),
            Reply::Bytes(ok_frame(&[0xCD])),
        ]);
        let resp = t.exchange(&Command::TestEeprom, FAST).unwrap();
        assert_eq!(resp.payload(), &[0xAB]);
        assert_eq!(t.sent.len(), 2);
        assert_eq!(t.replies.len(), 1);
    }

    #[test]
    fn truncated_payload_is_a_short_read() {
        // declares 4 bytes, delivers 2
        let mut t = MockTransport::new([Reply::Bytes(vec![0x00, 0x04, 0x00, 0x11, 0x22])]);
        let err = t
            .exchange(
                &Command::Read {
                    address: 0,
                    len: 4,
                },
                RetryPolicy {
                    attempts: 1,
                    backoff: Duration::ZERO,
                },
            )
            .unwrap_err();
        assert_eq!(
            err.transport_failure(),
            Some(&TransportFailure::ShortRead {
                expected: 4,
                received: 2
            })
        );
    }

    #[test]
    fn corrupted_crc_is_retried_as_transport_failure() {
        let mut bad = ok_frame(&[1, 2, 3, 4]);
        *bad.last_mut().unwrap() ^= 0x5A;
        let mut t = MockTransport::new([Reply::Bytes(bad.clone()), Reply::Bytes(bad)]);
        let err = t
            .exchange(
                &Command::read(0, 4),
                RetryPolicy {
                    attempts: 2,
                    backoff: Duration::ZERO,
                },
            )
            .unwrap_err();
        assert_eq!(t.sent.len(), 2);
        assert!(matches!(
            err.transport_failure(),
            Some(TransportFailure::ChecksumMismatch { .. })
        ));
        assert!(!matches!(err, Error::Device { .. }));
    }

    #[test]
    fn corrupted_crc_then_good_frame_succeeds() {
        let mut bad = ok_frame(&[9]);
        *bad.last_mut().unwrap() ^= 0x01;
        let mut t = MockTransport::new([Reply::Bytes(bad), Reply::Bytes(ok_frame(&[9]))]);
        let resp = t.exchange(&Command::TestEeprom, FAST).unwrap();
        assert_eq!(resp.payload(), &[9]);
    }

    #[test]
    fn write_failure_is_classified() {
        let mut t = MockTransport::new([Reply::WriteFails]);
        let err = t
            .exchange(
                &Command::ResetTarget,
                RetryPolicy {
                    attempts: 1,
                    backoff: Duration::ZERO,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err.transport_failure(),
            Some(TransportFailure::WriteError(_))
        ));
    }

    #[test]
    fn stale_bytes_are_flushed_before_request() {
        let mut t = MockTransport::new([Reply::Bytes(ok_frame(&[]))]);
        t.rx.extend([0xDE, 0xAD]);
        let resp = t.exchange(&Command::ResetTarget, FAST).unwrap();
        assert!(resp.is_ok());
        assert!(resp.payload().is_empty());
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut t = MockTransport::new([Reply::Bytes(ok_frame(&[]))]);
        let resp = t
            .exchange(
                &Command::Erase,
                RetryPolicy {
                    attempts: 0,
                    backoff: Duration::ZERO,
                },
            )
            .unwrap();
        assert!(resp.is_ok());
    }

    /// Raises the flag while the first attempt is waiting for bytes.
    struct CancelWhileWaiting {
        cancel: Rc<Cell<bool>>,
        sent: usize,
    }

    impl Transport for CancelWhileWaiting {
        fn clear_input(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn send_raw(&mut self, _raw: &[u8]) -> io::Result<()> {
            self.sent += 1;
            Ok(())
        }

        fn recv_raw(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            self.cancel.set(true);
            Ok(0)
        }
    }

    #[test]
    fn cancel_during_attempt_stops_retries() {
        let cancel = Rc::new(Cell::new(false));
        let mut t = CancelWhileWaiting {
            cancel: cancel.clone(),
            sent: 0,
        };
        let err = t
            .exchange_until(&Command::Erase, FAST, &|| cancel.get())
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(t.sent, 1);
    }

    #[test]
    fn cancel_during_last_attempt_is_reported_as_cancelled() {
        let cancel = Rc::new(Cell::new(false));
        let mut t = CancelWhileWaiting {
            cancel: cancel.clone(),
            sent: 0,
        };
        let once = RetryPolicy {
            attempts: 1,
            backoff: Duration::ZERO,
        };
        let err = t
            .exchange_until(&Command::Erase, once, &|| cancel.get())
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert_eq!(t.sent, 1);
    }

    #[test]
    fn cancel_before_first_attempt_sends_nothing() {
        let mut t = MockTransport::new([Reply::Bytes(ok_frame(&[]))]);
        let err = t
            .exchange_until(&Command::Erase, FAST, &|| true)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(t.sent.is_empty());
    }
}
