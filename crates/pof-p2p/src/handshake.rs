use pof_core::{serialize, sign, verify, Identity, KeyPair, PublicKey, Role, Sig};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::codec::{self, define_hashed_type};
use crate::error::{CodecError, P2pError};
use crate::peer::PeerInfo;

pub const CHALLENGE_TYPE: u16 = define_hashed_type("p2p.HandshakeChallenge");
pub const HELLO_TYPE: u16 = define_hashed_type("p2p.HandshakeHello");

const CHALLENGE_LEN: usize = 32;
const MAX_HANDSHAKE_PAYLOAD: usize = 1024;

#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    public_key: PublicKey,
    role: Role,
    signature: Sig,
}

fn hello_bytes(
    challenge: &[u8; CHALLENGE_LEN],
    public_key: &PublicKey,
    role: Role,
) -> Result<Vec<u8>, P2pError> {
    Ok(serialize::to_bytes(&(challenge, public_key, role))?)
}

/// Mutually authenticate a fresh connection.
///
/// Each side sends a random challenge, then a hello carrying its key and
/// role signed over the other side's challenge. Returns who the remote end
/// proved to be; whether that identity is welcome is the caller's call.
pub async fn handshake<S>(stream: &mut S, keypair: &KeyPair, role: Role) -> Result<PeerInfo, P2pError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    stream
        .write_all(&codec::encode(CHALLENGE_TYPE, &challenge)?)
        .await?;

    let frame = codec::decode(stream, MAX_HANDSHAKE_PAYLOAD).await?;
    if frame.packet_type != CHALLENGE_TYPE {
        return Err(CodecError::UnexpectedType(frame.packet_type).into());
    }
    let remote_challenge: [u8; CHALLENGE_LEN] = frame
        .payload
        .as_slice()
        .try_into()
        .map_err(|_| P2pError::Handshake("malformed challenge".to_string()))?;

    let hello = Hello {
        public_key: keypair.public,
        role,
        signature: sign(
            &keypair.secret,
            &hello_bytes(&remote_challenge, &keypair.public, role)?,
        ),
    };
    stream
        .write_all(&codec::encode(HELLO_TYPE, &serialize::to_bytes(&hello)?)?)
        .await?;

    let frame = codec::decode(stream, MAX_HANDSHAKE_PAYLOAD).await?;
    if frame.packet_type != HELLO_TYPE {
        return Err(CodecError::UnexpectedType(frame.packet_type).into());
    }
    let remote: Hello = serialize::from_bytes(&frame.payload)?;
    verify(
        &remote.public_key,
        &hello_bytes(&challenge, &remote.public_key, remote.role)?,
        &remote.signature,
    )
    .map_err(|_| P2pError::Handshake("bad hello signature".to_string()))?;

    let identity = Identity::new(remote.public_key);
    debug!(remote = %identity.address, role = %remote.role, "handshake complete");
    Ok(PeerInfo::new(identity, remote.role))
}
