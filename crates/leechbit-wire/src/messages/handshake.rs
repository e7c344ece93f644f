use bytes::Buf;
use std::io::Cursor;
use tokio::io::AsyncWriteExt;

use crate::{Decode, Encode, Error, Result};

/// The handshake is a required message and must be the first message transmitted by the client.
///
/// It is exchanged once per connection, outside of the length-prefixed message framing, and
/// always occupies exactly [`Handshake::LENGTH`] bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Eight reserved bytes that are used to specify extensions of the Bittorrent protocol.
    /// No extensions are negotiated, so these are sent as zeroes.
    pub reserved: [u8; 8],
    /// 20-byte SHA1 hash of the info key in the metainfo file. It's the same hash that was
    /// transmitted in the tracker request.
    pub info_hash: [u8; 20],
    /// 20-byte unique ID for the client. This is usually the same peer ID that was sent in the
    /// tracker request.
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub const PSTR: &'static [u8; 19] = b"BitTorrent protocol";
    pub const LENGTH: usize = 1 + 19 + 8 + 20 + 20;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Handshake {
            reserved: [0; 8],
            info_hash,
            peer_id,
        }
    }

    /// Checks that the remote side is talking about the same torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> Result<()> {
        if &self.info_hash != expected_info_hash {
            return Err(Error::BadHandshake("info hash doesn't match"));
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> [u8; Handshake::LENGTH] {
        let mut out = [0; Handshake::LENGTH];
        out[0] = Handshake::PSTR.len() as u8;
        out[1..20].copy_from_slice(Handshake::PSTR);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }
}

impl Encode for Handshake {
    async fn encode<T>(&self, dst: &mut T) -> Result<()>
    where
        T: AsyncWriteExt + Unpin,
    {
        dst.write_all(&self.to_bytes()).await?;

        Ok(())
    }
}

impl<'a> Decode<'a> for Handshake {
    fn decode(src: &'a [u8]) -> Result<Self> {
        check_length!(src.len(), Handshake::LENGTH);

        let mut src = Cursor::new(src);

        let pstr_len = src.get_u8() as usize;
        if pstr_len != Handshake::PSTR.len() {
            return Err(Error::BadHandshake("unexpected pstrlen"));
        }

        let mut pstr = [0; 19];
        src.copy_to_slice(&mut pstr);
        if &pstr != Handshake::PSTR {
            return Err(Error::BadHandshake("unknown protocol string"));
        }

        let mut reserved = [0; 8];
        src.copy_to_slice(&mut reserved);

        let mut info_hash = [0; 20];
        src.copy_to_slice(&mut info_hash);

        let mut peer_id = [0; 20];
        src.copy_to_slice(&mut peer_id);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn encodes_to_fixed_68_bytes() {
        let handshake = Handshake::new([7; 20], *b"-LB0100-abcdefghijkl");
        let mut out = Vec::new();
        handshake.encode(&mut out).await.expect("encoding failed");

        assert_eq!(out.len(), 68);
        assert_eq!(out[0], 19);
        assert_eq!(&out[1..20], b"BitTorrent protocol");
        assert_eq!(&out[20..28], &[0; 8]);
        assert_eq!(&out[28..48], &[7; 20]);
        assert_eq!(&out[48..68], b"-LB0100-abcdefghijkl");

        let decoded = Handshake::decode(&out).expect("decoding failed");
        assert_eq!(decoded, handshake);
    }

    #[test]
    fn rejects_foreign_protocol_and_short_input() {
        let mut raw = Handshake::new([1; 20], [2; 20]).to_bytes();
        raw[1] = b'b';
        assert!(matches!(Handshake::decode(&raw), Err(Error::BadHandshake(_))));

        assert!(matches!(Handshake::decode(&raw[..40]), Err(Error::BadLength(68, 40))));
    }

    #[test]
    fn validate_checks_info_hash() {
        let handshake = Handshake::new([1; 20], [2; 20]);
        assert!(handshake.validate(&[1; 20]).is_ok());
        assert!(handshake.validate(&[3; 20]).is_err());
    }
}
