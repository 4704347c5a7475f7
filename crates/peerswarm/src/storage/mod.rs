// Where verified pieces go, and where uploads are read from. Offsets are absolute
// within the torrent; mapping them onto files is up to the implementation.

pub mod inmemory;

pub use inmemory::InMemoryStorage;

use crate::assembler::AssembledPiece;

pub trait TorrentStorage: Send + Sync {
    /// Persist a verified piece starting at `offset`.
    fn write_piece(&self, offset: u64, piece: &AssembledPiece) -> anyhow::Result<()>;

    /// Fill `buf` entirely with bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()>;
}

impl<T: TorrentStorage + ?Sized> TorrentStorage for Box<T> {
    fn write_piece(&self, offset: u64, piece: &AssembledPiece) -> anyhow::Result<()> {
        (**self).write_piece(offset, piece)
    }

    fn read(&self, offset: u64, buf: &mut [u8]) -> anyhow::Result<()> {
        (**self).read(offset, buf)
    }
}
