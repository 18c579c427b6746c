//! Moves bytes between a serial port and a frame handler.

use crate::analog::AnalogOutput;
use crate::buffer::RxBuffer;
use crate::cfg_flash::ConfigFlash;
use crate::detector::DetectorBus;
use crate::engine::{Engine, Uptime};
use crate::frame::{Frame, FrameDecoder};
use core::convert::Infallible;
use embedded_hal::{blocking::delay::DelayUs, digital::v2::OutputPin, serial};

/// Bytes pulled from the port per refill; one USB full-speed packet.
const RX_CHUNK: usize = 64;

pub trait FrameHandler {
    /// Handles one frame and returns the length of the reply now held in
    /// [`Self::reply`]; 0 when there is nothing to send.
    fn handle_frame(&mut self, frame: &Frame<'_>) -> usize;

    fn reply(&self) -> &[u8];
}

impl<B, A, S, D, F, C> FrameHandler for Engine<B, A, S, D, F, C>
where
    B: DetectorBus,
    A: AnalogOutput,
    S: OutputPin,
    D: DelayUs<u32>,
    F: ConfigFlash,
    C: Uptime,
{
    fn handle_frame(&mut self, frame: &Frame<'_>) -> usize {
        Engine::handle_frame(self, frame).map_or(0, |reply| reply.len())
    }

    fn reply(&self) -> &[u8] {
        self.last_reply()
    }
}

/// Serial side of the protocol. One request is in flight at a time: nothing
/// new is decoded until the previous reply has been fully written.
pub struct Link {
    decoder: FrameDecoder,
    rx: RxBuffer<RX_CHUNK>,
    sent: usize,
    reply_len: usize,
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}

impl Link {
    pub fn new() -> Self {
        Self {
            decoder: FrameDecoder::new(),
            rx: RxBuffer::new(),
            sent: 0,
            reply_len: 0,
        }
    }

    /// True while part of a reply is still waiting for the port.
    pub fn is_sending(&self) -> bool {
        self.sent < self.reply_len
    }

    /// Does as much work as the port allows without blocking: finishes the
    /// current reply, then reads, decodes and dispatches frames until the
    /// port runs dry or stops accepting output.
    pub fn poll<P, H>(&mut self, port: &mut P, handler: &mut H)
    where
        P: serial::Read<u8> + serial::Write<u8>,
        H: FrameHandler + ?Sized,
    {
        loop {
            if !self.flush(port, handler) {
                return;
            }

            if self.rx.available_read() == 0 {
                let _ = self.rx.fill(|space| {
                    let mut count = 0;
                    for slot in space.iter_mut() {
                        match port.read() {
                            Ok(byte) => *slot = byte,
                            Err(_) => break,
                        }
                        count += 1;
                    }
                    Ok::<_, Infallible>(count)
                });
                if self.rx.available_read() == 0 {
                    return;
                }
            }

            let (used, reply_len) = match self.decoder.push(self.rx.data()) {
                (used, Some(frame)) => (used, handler.handle_frame(&frame)),
                (used, None) => (used, 0),
            };
            self.rx.consume(used);

            if reply_len > 0 {
                self.sent = 0;
                self.reply_len = reply_len;
            }
        }
    }

    /// Returns false if the port filled up before the reply was out.
    fn flush<P, H>(&mut self, port: &mut P, handler: &H) -> bool
    where
        P: serial::Write<u8>,
        H: FrameHandler + ?Sized,
    {
        if self.reply_len == 0 {
            return true;
        }

        let reply = handler.reply();
        while self.sent < self.reply_len {
            let Some(&byte) = reply.get(self.sent) else {
                log::error!("reply shrank to {} of {} bytes", reply.len(), self.reply_len);
                break;
            };
            if port.write(byte).is_err() {
                let _ = port.flush();
                return false;
            }
            self.sent += 1;
        }

        let _ = port.flush();
        self.sent = 0;
        self.reply_len = 0;
        true
    }
}
