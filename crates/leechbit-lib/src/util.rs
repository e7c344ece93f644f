use rand::distributions::Alphanumeric;
use rand::Rng;

const PEER_ID_PREFIX: &[u8; 8] = b"-LB0100-";

/// Azureus-style peer id: client tag and version followed by random alphanumerics
pub fn generate_peer_id() -> [u8; 20] {
    let mut rng = rand::thread_rng();
    let mut peer_id = [0; 20];
    peer_id[..PEER_ID_PREFIX.len()].copy_from_slice(PEER_ID_PREFIX);
    peer_id[PEER_ID_PREFIX.len()..]
        .iter_mut()
        .for_each(|byte| *byte = rng.sample(Alphanumeric));
    peer_id
}
