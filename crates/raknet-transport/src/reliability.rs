//! Reliability kinds carried in the top three bits of a frame's flag byte.

use crate::error::DecodeError;

/// Delivery guarantee requested for one message.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reliability {
    #[default]
    Unreliable = 0,
    UnreliableSequenced = 1,
    Reliable = 2,
    ReliableOrdered = 3,
    ReliableSequenced = 4,
    /// Unreliable, but the sender is told whether the datagram was acknowledged.
    UnreliableWithAckReceipt = 5,
    ReliableWithAckReceipt = 6,
    ReliableOrderedWithAckReceipt = 7,
}

impl Reliability {
    pub const ALL: [Reliability; 8] = [
        Reliability::Unreliable,
        Reliability::UnreliableSequenced,
        Reliability::Reliable,
        Reliability::ReliableOrdered,
        Reliability::ReliableSequenced,
        Reliability::UnreliableWithAckReceipt,
        Reliability::ReliableWithAckReceipt,
        Reliability::ReliableOrderedWithAckReceipt,
    ];

    pub fn from_id(id: u8) -> Result<Self, DecodeError> {
        Self::ALL
            .get(id as usize)
            .copied()
            .ok_or(DecodeError::InvalidReliability(id))
    }

    pub fn id(self) -> u8 {
        self as u8
    }

    /// Frame carries a message index and is retransmitted until acknowledged.
    pub fn is_reliable(self) -> bool {
        matches!(
            self,
            Reliability::Reliable
                | Reliability::ReliableOrdered
                | Reliability::ReliableSequenced
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_ordered(self) -> bool {
        matches!(
            self,
            Reliability::ReliableOrdered | Reliability::ReliableOrderedWithAckReceipt
        )
    }

    pub fn is_sequenced(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableSequenced | Reliability::ReliableSequenced
        )
    }

    /// Frame carries an order index and channel byte.
    pub fn has_order_index(self) -> bool {
        self.is_ordered() || self.is_sequenced()
    }

    pub fn requires_ack_receipt(self) -> bool {
        matches!(
            self,
            Reliability::UnreliableWithAckReceipt
                | Reliability::ReliableWithAckReceipt
                | Reliability::ReliableOrderedWithAckReceipt
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_roundtrip() {
        for r in Reliability::ALL {
            assert_eq!(Reliability::from_id(r.id()).unwrap(), r);
        }
        assert_eq!(
            Reliability::from_id(8),
            Err(DecodeError::InvalidReliability(8))
        );
    }

    #[test]
    fn property_table() {
        use Reliability::*;
        // (kind, reliable, ordered, sequenced, receipt)
        let table = [
            (Unreliable, false, false, false, false),
            (UnreliableSequenced, false, false, true, false),
            (Reliable, true, false, false, false),
            (ReliableOrdered, true, true, false, false),
            (ReliableSequenced, true, false, true, false),
            (UnreliableWithAckReceipt, false, false, false, true),
            (ReliableWithAckReceipt, true, false, false, true),
            (ReliableOrderedWithAckReceipt, true, true, false, true),
        ];
        for (kind, reliable, ordered, sequenced, receipt) in table {
            assert_eq!(kind.is_reliable(), reliable, "{kind:?}");
            assert_eq!(kind.is_ordered(), ordered, "{kind:?}");
            assert_eq!(kind.is_sequenced(), sequenced, "{kind:?}");
            assert_eq!(kind.requires_ack_receipt(), receipt, "{kind:?}");
        }
    }
}
