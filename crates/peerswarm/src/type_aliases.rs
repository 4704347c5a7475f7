pub type BF = bitvec::vec::BitVec<u8, bitvec::order::Msb0>;

/// Inbound Piece payloads on their way from a peer's read pump to the block consumer.
pub type BlockTx = tokio::sync::mpsc::Sender<crate::assembler::Block>;
pub type BlockRx = tokio::sync::mpsc::Receiver<crate::assembler::Block>;

/// Serialized wire messages waiting for a peer's write pump.
pub type PreparedPacket = buffers::PooledBuf;
