//! Cluster slot mapping for key co-location.
//!
//! A callee connection pumps several URI queues over one backend connection,
//! so in cluster mode all of its keys must live on one shard. Slots follow
//! the cluster convention: CRC16/XMODEM over the key (reduced to its hash
//! tag when one is present), modulo 16384.

use super::super::{BrokerError, Result};

const SLOT_COUNT: u16 = 16384;

/// CRC16/XMODEM (poly 0x1021, init 0).
fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let mut crc = crc ^ ((byte as u16) << 8);
        for _ in 0..8 {
            crc = if crc & 0x8000 != 0 {
                (crc << 1) ^ 0x1021
            } else {
                crc << 1
            };
        }
        crc
    })
}

/// The tag between the first `{` and the next `}`, when non-empty.
fn hash_tag(key: &[u8]) -> &[u8] {
    if let Some(open) = key.iter().position(|&b| b == b'{') {
        if let Some(close) = key[open + 1..].iter().position(|&b| b == b'}') {
            if close > 0 {
                return &key[open + 1..open + 1 + close];
            }
        }
    }
    key
}

/// The cluster slot a key maps to.
pub(crate) fn key_slot(key: &str) -> u16 {
    crc16(hash_tag(key.as_bytes())) % SLOT_COUNT
}

/// Fail with [`BrokerError::CrossShard`] unless every key maps to the same
/// slot.
pub(crate) fn ensure_single_slot(keys: &[String]) -> Result<()> {
    let mut slots = keys.iter().map(|k| (k, key_slot(k)));
    let Some((first_key, first_slot)) = slots.next() else {
        return Ok(());
    };
    for (key, slot) in slots {
        if slot != first_slot {
            return Err(BrokerError::CrossShard(format!(
                "{first_key} is in slot {first_slot} but {key} is in slot {slot}"
            )));
        }
    }
    Ok(())
}
