// Rolling XOR stream cipher used by the game after the key exchange.
//
// Each direction advances its key by the size of every packet it processes,
// so the relay keeps four independent states: what it reads from each peer
// and what it writes to each peer. They stay in step as long as traffic is
// forwarded unmodified and diverge as soon as a packet is replaced, dropped
// or injected.

use crate::packet::EndpointType;

/// Fixed second half of every session key.
const KEY_SUFFIX: [u8; 8] = [0xc8, 0x27, 0x93, 0x01, 0xa1, 0x6c, 0x31, 0x97];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherState {
    key: [u8; 16],
}

impl CipherState {
    pub fn from_seed(seed: &[u8; 8]) -> Self {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(seed);
        key[8..].copy_from_slice(&KEY_SUFFIX);
        Self { key }
    }

    pub fn decipher(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, b) in data.iter_mut().enumerate() {
            let cipher = *b;
            *b = cipher ^ self.key[i & 15] ^ prev;
            prev = cipher;
        }
        self.advance(data.len());
    }

    pub fn encipher(&mut self, data: &mut [u8]) {
        let mut prev = 0u8;
        for (i, b) in data.iter_mut().enumerate() {
            prev ^= *b ^ self.key[i & 15];
            *b = prev;
        }
        self.advance(data.len());
    }

    fn advance(&mut self, size: usize) {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.key[8..12]);
        let next = u32::from_le_bytes(word).wrapping_add(size as u32);
        self.key[8..12].copy_from_slice(&next.to_le_bytes());
    }
}

#[derive(Debug, Clone)]
struct Legs {
    from_client: CipherState,
    to_server: CipherState,
    from_server: CipherState,
    to_client: CipherState,
}

/// Cipher states of one relayed connection. Disabled until the key is known.
#[derive(Debug, Clone, Default)]
pub struct SessionCipher {
    legs: Option<Legs>,
}

impl SessionCipher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enable(&mut self, seed: &[u8; 8]) {
        let state = CipherState::from_seed(seed);
        self.legs = Some(Legs {
            from_client: state.clone(),
            to_server: state.clone(),
            from_server: state.clone(),
            to_client: state,
        });
    }

    pub fn is_enabled(&self) -> bool {
        self.legs.is_some()
    }

    /// Deciphers a packet received from `sender`.
    pub fn decipher_inbound(&mut self, sender: EndpointType, data: &mut [u8]) {
        if let Some(legs) = &mut self.legs {
            match sender {
                EndpointType::Client => legs.from_client.decipher(data),
                EndpointType::Server => legs.from_server.decipher(data),
            }
        }
    }

    /// Enciphers a packet from `sender` before it is written to the other peer.
    pub fn encipher_outbound(&mut self, sender: EndpointType, data: &mut [u8]) {
        if let Some(legs) = &mut self.legs {
            match sender {
                EndpointType::Client => legs.to_server.encipher(data),
                EndpointType::Server => legs.to_client.encipher(data),
            }
        }
    }
}
