use super::TS_PACKET_SIZE;
use std::convert::TryInto;

/// Slices an arbitrary byte feed into complete 188-byte packets.
///
/// Bytes left over from a feed that does not end on a packet boundary are
/// carried into the next call, so callers may deliver data in chunks of any
/// size. The framer does no validation; sync byte checking is the packet
/// sink's job.
pub struct PacketFramer {
    carry: [u8; TS_PACKET_SIZE],
    fill: usize,
}

impl Default for PacketFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketFramer {
    pub fn new() -> Self {
        Self {
            carry: [0; TS_PACKET_SIZE],
            fill: 0,
        }
    }

    /// Number of buffered bytes waiting for the rest of their packet.
    pub fn pending(&self) -> usize {
        self.fill
    }

    /// Append `bytes`, handing every completed packet to `sink` front to
    /// back. Anything short of a full packet is retained.
    pub fn feed<F>(&mut self, mut bytes: &[u8], mut sink: F)
    where
        F: FnMut(&[u8; TS_PACKET_SIZE]),
    {
        if self.fill != 0 {
            /* incomplete packet left over from the previous call */
            let needed = TS_PACKET_SIZE - self.fill;
            if bytes.len() < needed {
                self.carry[self.fill..self.fill + bytes.len()].copy_from_slice(bytes);
                self.fill += bytes.len();
                return;
            }
            self.carry[self.fill..].copy_from_slice(&bytes[..needed]);
            bytes = &bytes[needed..];
            self.fill = 0;
            sink(&self.carry);
        }

        /* submit as much as possible */
        while bytes.len() >= TS_PACKET_SIZE {
            let (packet, rest) = bytes.split_at(TS_PACKET_SIZE);
            sink(packet.try_into().expect("length checked by split_at"));
            bytes = rest;
        }

        /* save the tail for the next call */
        if !bytes.is_empty() {
            self.carry[..bytes.len()].copy_from_slice(bytes);
            self.fill = bytes.len();
        }
    }
}
