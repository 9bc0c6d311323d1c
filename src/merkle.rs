use crate::template::dsha256;
use std::collections::VecDeque;

/// Folds a list of txids (internal byte order) into a merkle root.
/// An odd level repeats its last entry before pairing.
pub fn merkle_from_txids(txids: Vec<[u8; 32]>) -> [u8; 32] {
    if txids.is_empty() {
        return dsha256(b"");
    }
    if txids.len() == 1 {
        return txids[0];
    }
    let mut txids: VecDeque<_> = txids.into_iter().collect();
    let mut data = Vec::with_capacity(32 * 2);
    while txids.len() > 1 {
        if txids.len() % 2 == 1 {
            txids.push_back(*txids.back().unwrap());
        }
        let mut next_level = VecDeque::with_capacity(txids.len() / 2);
        while let (Some(left), Some(right)) = (txids.pop_front(), txids.pop_front()) {
            data.clear();
            data.extend_from_slice(&left);
            data.extend_from_slice(&right);
            next_level.push_back(dsha256(&data));
        }
        txids = next_level;
    }
    txids.pop_front().unwrap()
}
