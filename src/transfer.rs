//! Per-endpoint transfer engine.
//!
//! Each bound physical endpoint owns one or two packet buffers in endpoint
//! SRAM. The hardware works through the command/status entries in order;
//! `stage` is the next buffer software hands to the hardware (IN) or takes a
//! received packet from (OUT), `done` is the next buffer the hardware is
//! expected to finish.

use alloc::vec::Vec;

use log::{debug, trace, warn};
use tock_registers::interfaces::{ReadWriteable, Readable, Writeable};
use usb_if::{
    descriptor::{BufferMode, EndpointAddress, EndpointDescriptor, EndpointType},
    transfer::Direction,
};

use crate::{
    err::*,
    ram::Region,
    reg::{EPCS, Usbhs, physical_index},
};

/// Called from interrupt context when a transfer on the endpoint completed.
///
/// For IN endpoints this is once per finished `write`, for OUT endpoints once
/// per received packet. The packet stays in its buffer until
/// [`EndpointIo::read`] takes it.
pub trait EndpointHandler: Send + 'static {
    fn transfer_complete(&mut self, io: &mut EndpointIo<'_>);
}

impl<F> EndpointHandler for F
where
    F: FnMut(&mut EndpointIo<'_>) + Send + 'static,
{
    fn transfer_complete(&mut self, io: &mut EndpointIo<'_>) {
        self(io)
    }
}

pub(crate) struct EndpointState {
    desc: EndpointDescriptor,
    physical: usize,
    buffers: Vec<Region>,
    armed: [bool; 2],
    /// IN: the buffer carries the final packet of a `write`.
    last: [bool; 2],
    /// OUT: length of a received packet still waiting for `read`.
    pending: [Option<usize>; 2],
    stage: usize,
    done: usize,
    in_flight: usize,
}

impl EndpointState {
    pub fn new(desc: EndpointDescriptor, buffers: Vec<Region>) -> Self {
        debug_assert_eq!(buffers.len(), desc.buffer_mode.buffers());
        Self {
            physical: physical_index(desc.number, desc.direction),
            desc,
            buffers,
            armed: [false; 2],
            last: [false; 2],
            pending: [None; 2],
            stage: 0,
            done: 0,
            in_flight: 0,
        }
    }

    pub fn address(&self) -> EndpointAddress {
        self.desc.address()
    }

    pub fn physical(&self) -> usize {
        self.physical
    }

    pub fn buffers(&self) -> &[Region] {
        &self.buffers
    }

    pub fn max_packet_size(&self) -> usize {
        self.desc.max_packet_size as usize
    }

    /// Bytes a single `write` may stage right now.
    pub fn write_capacity(&self) -> usize {
        (self.buffers.len() - self.in_flight) * self.max_packet_size()
    }

    pub fn has_packet(&self) -> bool {
        self.pending[self.stage].is_some()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.buffers.len()
    }

    fn reset_cursors(&mut self) {
        self.armed = [false; 2];
        self.last = [false; 2];
        self.pending = [None; 2];
        self.stage = 0;
        self.done = 0;
        self.in_flight = 0;
    }

    /// Writes the command list entries for this endpoint, all buffers idle.
    pub fn configure(&mut self, hw: &Usbhs) {
        let kind = match self.desc.transfer_type {
            EndpointType::Isochronous => EPCS::T::Isochronous,
            _ => EPCS::T::Generic,
        };
        for (index, region) in self.buffers.iter().enumerate() {
            hw.entry(self.physical, index)
                .write(EPCS::ADDROFF.val(Usbhs::addroff(region.offset)) + kind + EPCS::TR::SET);
        }
        let regs = hw.regs();
        Usbhs::set_bit(
            &regs.epbufcfg,
            self.physical,
            self.desc.buffer_mode == BufferMode::Double,
        );
        Usbhs::set_bit(&regs.epinuse, self.physical, false);
        self.reset_cursors();
        debug!(
            "{}: configured, phys {}, {:?} buffered, mps {}",
            self.address(),
            self.physical,
            self.desc.buffer_mode,
            self.desc.max_packet_size
        );
    }

    /// Takes the endpoint away from the hardware.
    pub fn disable(&mut self, hw: &Usbhs) {
        for index in 0..self.buffers.len() {
            hw.entry(self.physical, index).write(EPCS::D::SET);
        }
        let regs = hw.regs();
        Usbhs::set_bit(&regs.epbufcfg, self.physical, false);
        Usbhs::set_bit(&regs.inten, self.physical, false);
        self.reset_cursors();
    }

    /// Enables the completion interrupt and hands every idle OUT buffer to
    /// the hardware.
    pub fn start(&mut self, hw: &Usbhs) {
        Usbhs::set_bit(&hw.regs().inten, self.physical, true);
        if self.desc.direction == Direction::Out {
            for index in 0..self.buffers.len() {
                if !self.armed[index] && self.pending[index].is_none() {
                    self.arm(hw, index, self.max_packet_size());
                }
            }
        }
    }

    /// Abandons whatever is queued. Used by `stop` and before teardown.
    pub fn abort(&mut self, hw: &Usbhs) {
        for index in 0..self.buffers.len() {
            hw.entry(self.physical, index).modify(EPCS::A::CLEAR);
        }
        if self.in_flight > 0 || self.armed.iter().any(|a| *a) {
            trace!("{}: transfer abandoned", self.address());
        }
        let regs = hw.regs();
        Usbhs::set_bit(&regs.inten, self.physical, false);
        Usbhs::set_bit(&regs.epinuse, self.physical, false);
        self.reset_cursors();
    }

    fn arm(&mut self, hw: &Usbhs, index: usize, len: usize) {
        let region = self.buffers[index];
        hw.entry(self.physical, index).modify(
            EPCS::ADDROFF.val(Usbhs::addroff(region.offset))
                + EPCS::NBYTES.val(len as u32)
                + EPCS::TR::CLEAR
                + EPCS::A::SET,
        );
        self.armed[index] = true;
    }

    pub fn write(&mut self, hw: &Usbhs, data: &[u8]) -> Result {
        if self.desc.direction != Direction::In {
            return Err(UsbdError::EndpointDirection);
        }
        let mps = self.max_packet_size();
        let needed = data.len().div_ceil(mps).max(1);
        if needed > self.buffers.len() - self.in_flight {
            return Err(UsbdError::PacketSizeOverflow);
        }

        let stage = |state: &mut Self, chunk: &[u8], last: bool| {
            let index = state.stage;
            hw.write_buffer(state.buffers[index].offset, chunk);
            state.last[index] = last;
            state.arm(hw, index, chunk.len());
            state.stage = state.next(index);
            state.in_flight += 1;
        };
        if data.is_empty() {
            stage(self, &[], true);
        } else {
            for (i, chunk) in data.chunks(mps).enumerate() {
                stage(self, chunk, i + 1 == needed);
            }
        }
        trace!("{}: queued {} bytes", self.address(), data.len());
        Ok(())
    }

    pub fn read(&mut self, hw: &Usbhs, out: &mut [u8]) -> Result<usize> {
        if self.desc.direction != Direction::Out {
            return Err(UsbdError::EndpointDirection);
        }
        let index = self.stage;
        let Some(len) = self.pending[index] else {
            return Ok(0);
        };
        if out.len() < len {
            return Err(UsbdError::PacketSizeOverflow);
        }
        hw.read_buffer(self.buffers[index].offset, &mut out[..len]);
        self.pending[index] = None;
        self.arm(hw, index, self.max_packet_size());
        self.stage = self.next(index);
        trace!("{}: read {} bytes", self.address(), len);
        Ok(len)
    }

    /// Collects buffers the hardware has finished with. Returns how many
    /// completion notifications the endpoint handler is owed.
    pub fn complete(&mut self, hw: &Usbhs) -> usize {
        let mut notify = 0;
        for _ in 0..self.buffers.len() {
            let index = self.done;
            let entry = hw.entry(self.physical, index);
            if !self.armed[index] || entry.is_set(EPCS::A) {
                break;
            }
            self.armed[index] = false;
            self.done = self.next(index);
            match self.desc.direction {
                Direction::In => {
                    self.in_flight -= 1;
                    if core::mem::take(&mut self.last[index]) {
                        notify += 1;
                    }
                }
                Direction::Out => {
                    let remaining = entry.read(EPCS::NBYTES) as usize;
                    self.pending[index] = Some(self.max_packet_size().saturating_sub(remaining));
                    notify += 1;
                }
            }
        }
        if notify == 0 && self.in_flight == 0 {
            warn!("{}: spurious completion", self.address());
        }
        notify
    }

    pub fn set_stalled(&mut self, hw: &Usbhs, stalled: bool) {
        for index in 0..self.buffers.len() {
            let entry = hw.entry(self.physical, index);
            if stalled {
                entry.modify(EPCS::S::SET);
            } else {
                // clearing a halt restarts the data toggle at DATA0
                entry.modify(EPCS::S::CLEAR + EPCS::TR::SET + EPCS::RF_TV::CLEAR);
            }
        }
        if stalled {
            warn!("{}: stalled", self.address());
        }
    }

    pub fn is_stalled(&self, hw: &Usbhs) -> bool {
        hw.entry(self.physical, 0).is_set(EPCS::S)
    }
}

/// Access to one endpoint from inside its completion handler.
pub struct EndpointIo<'a> {
    state: &'a mut EndpointState,
    hw: &'a Usbhs,
}

impl<'a> EndpointIo<'a> {
    pub(crate) fn new(state: &'a mut EndpointState, hw: &'a Usbhs) -> Self {
        Self { state, hw }
    }

    pub fn address(&self) -> EndpointAddress {
        self.state.address()
    }

    pub fn max_packet_size(&self) -> usize {
        self.state.max_packet_size()
    }

    /// A received packet is waiting, possibly zero length.
    pub fn has_packet(&self) -> bool {
        self.state.has_packet()
    }

    pub fn write(&mut self, data: &[u8]) -> Result {
        self.state.write(self.hw, data)
    }

    pub fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.state.read(self.hw, out)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::mock::MockBoard;

    fn bulk(direction: Direction, mode: BufferMode) -> EndpointDescriptor {
        EndpointDescriptor {
            number: 1,
            direction,
            transfer_type: EndpointType::Bulk,
            max_packet_size: 64,
            buffer_mode: mode,
        }
    }

    fn state(direction: Direction, mode: BufferMode) -> EndpointState {
        let buffers = (0..mode.buffers())
            .map(|i| Region {
                offset: 0x100 + i * 64,
                size: 64,
            })
            .collect();
        EndpointState::new(bulk(direction, mode), buffers)
    }

    #[test]
    fn configure_points_entries_at_buffers() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Double);
        ep.configure(&hw);

        assert_eq!(ep.physical(), 3);
        assert_eq!(hw.entry(3, 0).read(EPCS::ADDROFF), 4);
        assert_eq!(hw.entry(3, 1).read(EPCS::ADDROFF), 5);
        assert!(!hw.entry(3, 0).is_set(EPCS::A));
        assert_eq!(hw.regs().epbufcfg.get(), 1 << 3);
    }

    #[test]
    fn write_stages_one_packet_per_buffer() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Double);
        ep.configure(&hw);

        let data: Vec<u8> = (0..100).collect();
        ep.write(&hw, &data).unwrap();
        assert!(board.is_active(3, 0));
        assert!(board.is_active(3, 1));
        assert_eq!(ep.write_capacity(), 0);
        assert_eq!(ep.write(&hw, &[1]), Err(UsbdError::PacketSizeOverflow));

        assert_eq!(board.host_in(3, 0), &data[..64]);
        assert_eq!(ep.complete(&hw), 0);
        assert_eq!(board.host_in(3, 1), &data[64..]);
        assert_eq!(ep.complete(&hw), 1);
        assert_eq!(ep.write_capacity(), 128);
    }

    #[test]
    fn back_to_back_writes_complete_separately() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Double);
        ep.configure(&hw);

        ep.write(&hw, &[1; 10]).unwrap();
        ep.write(&hw, &[2; 10]).unwrap();

        assert_eq!(board.host_in(3, 0), [1u8; 10]);
        assert_eq!(ep.complete(&hw), 1);
        assert_eq!(ep.write_capacity(), 64);
        assert_eq!(board.host_in(3, 1), [2u8; 10]);
        assert_eq!(ep.complete(&hw), 1);
        assert_eq!(ep.write_capacity(), 128);
    }

    #[test]
    fn oversized_write_arms_nothing() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Single);
        ep.configure(&hw);

        assert_eq!(ep.write(&hw, &[0; 65]), Err(UsbdError::PacketSizeOverflow));
        assert!(!board.is_active(3, 0));
        ep.write(&hw, &[0; 64]).unwrap();
        assert!(board.is_active(3, 0));
    }

    #[test]
    fn empty_write_is_a_zero_length_packet() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Single);
        ep.configure(&hw);

        ep.write(&hw, &[]).unwrap();
        assert!(board.is_active(3, 0));
        assert_eq!(hw.entry(3, 0).read(EPCS::NBYTES), 0);
    }

    #[test]
    fn out_packets_are_held_until_read() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::Out, BufferMode::Double);
        ep.configure(&hw);
        ep.start(&hw);

        let mut buf = vec![0u8; 64];
        assert_eq!(ep.read(&hw, &mut buf), Ok(0));

        board.host_out(2, 0, b"first");
        board.host_out(2, 1, b"second");
        assert_eq!(ep.complete(&hw), 2);
        assert!(!board.is_active(2, 0));

        let mut small = [0u8; 3];
        assert_eq!(ep.read(&hw, &mut small), Err(UsbdError::PacketSizeOverflow));

        assert_eq!(ep.read(&hw, &mut buf), Ok(5));
        assert_eq!(&buf[..5], b"first");
        assert!(board.is_active(2, 0));
        assert_eq!(ep.read(&hw, &mut buf), Ok(6));
        assert_eq!(&buf[..6], b"second");
        assert_eq!(ep.read(&hw, &mut buf), Ok(0));
    }

    #[test]
    fn direction_is_enforced() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::Out, BufferMode::Single);
        ep.configure(&hw);
        assert_eq!(ep.write(&hw, &[1]), Err(UsbdError::EndpointDirection));
    }

    #[test]
    fn abort_drops_queued_data() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Single);
        ep.configure(&hw);
        ep.write(&hw, &[1, 2, 3]).unwrap();
        ep.abort(&hw);
        assert!(!board.is_active(3, 0));
        assert_eq!(ep.write_capacity(), 64);
    }

    #[test]
    fn stall_round_trip() {
        let board = MockBoard::new();
        let hw = board.usbhs();
        let mut ep = state(Direction::In, BufferMode::Single);
        ep.configure(&hw);
        ep.set_stalled(&hw, true);
        assert!(ep.is_stalled(&hw));
        ep.set_stalled(&hw, false);
        assert!(!ep.is_stalled(&hw));
        assert!(hw.entry(3, 0).is_set(EPCS::TR));
    }
}
