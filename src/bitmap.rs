//! Bit twiddling on little endian bitmaps (bit `n` is bit `n % 8` of byte `n / 8`).

pub fn test_bit(bits: &[u8], n: u64) -> bool {
    match bits.get((n / 8) as usize) {
        Some(b) => b & (1 << (n % 8)) != 0,
        None => false,
    }
}

pub fn set_bit(bits: &mut [u8], n: u64) {
    if let Some(b) = bits.get_mut((n / 8) as usize) {
        *b |= 1 << (n % 8);
    }
}

pub fn clear_bit(bits: &mut [u8], n: u64) {
    if let Some(b) = bits.get_mut((n / 8) as usize) {
        *b &= !(1 << (n % 8));
    }
}

/// First cleared bit at or after `from`.
pub fn find_first_clear(bits: &[u8], from: u64) -> Option<u64> {
    let total = bits.len() as u64 * 8;
    let mut n = from;
    while n < total {
        let byte = bits[(n / 8) as usize];
        if n % 8 == 0 && byte == 0xff {
            n += 8;
            continue;
        }
        if byte & (1 << (n % 8)) == 0 {
            return Some(n);
        }
        n += 1;
    }
    None
}

/// Highest set bit strictly below `below`.
pub fn find_last_set(bits: &[u8], below: u64) -> Option<u64> {
    let mut n = below.min(bits.len() as u64 * 8);
    while n > 0 {
        n -= 1;
        let byte = bits[(n / 8) as usize];
        if n % 8 == 7 && byte == 0 {
            // skip the whole byte, the loop decrement handles the last step
            n -= 7;
            continue;
        }
        if byte & (1 << (n % 8)) != 0 {
            return Some(n);
        }
    }
    None
}

pub fn count_set(bits: &[u8]) -> u64 {
    bits.iter().map(|b| b.count_ones() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear() {
        let mut bits = vec![0u8; 2];
        set_bit(&mut bits, 0);
        set_bit(&mut bits, 9);
        assert!(test_bit(&bits, 0));
        assert!(!test_bit(&bits, 1));
        assert!(test_bit(&bits, 9));
        assert_eq!(2, count_set(&bits));
        clear_bit(&mut bits, 9);
        assert!(!test_bit(&bits, 9));
        // Out of range is never set
        assert!(!test_bit(&bits, 100));
    }

    #[test]
    fn first_clear() {
        let mut bits = vec![0xffu8, 0xff, 0b0000_0111];
        assert_eq!(Some(19), find_first_clear(&bits, 0));
        assert_eq!(Some(20), find_first_clear(&bits, 20));
        bits[2] = 0xff;
        assert_eq!(None, find_first_clear(&bits, 0));
        assert_eq!(None, find_first_clear(&[], 0));
    }

    #[test]
    fn last_set() {
        let bits = vec![0b0000_0010u8, 0, 0b1000_0000, 0];
        assert_eq!(Some(23), find_last_set(&bits, 32));
        assert_eq!(Some(1), find_last_set(&bits, 23));
        assert_eq!(Some(1), find_last_set(&bits, 2));
        assert_eq!(None, find_last_set(&bits, 1));
        assert_eq!(None, find_last_set(&[0, 0], 16));
    }
}
