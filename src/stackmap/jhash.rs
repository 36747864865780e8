//! Bob Jenkins' lookup3 word hash, as used by the kernel's `jhash2()`.

const JHASH_INITVAL: u32 = 0xdead_beef;

#[inline(always)]
fn mix(a: &mut u32, b: &mut u32, c: &mut u32) {
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(4);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(6);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(8);
    *b = b.wrapping_add(*a);
    *a = a.wrapping_sub(*c);
    *a ^= c.rotate_left(16);
    *c = c.wrapping_add(*b);
    *b = b.wrapping_sub(*a);
    *b ^= a.rotate_left(19);
    *a = a.wrapping_add(*c);
    *c = c.wrapping_sub(*b);
    *c ^= b.rotate_left(4);
    *b = b.wrapping_add(*a);
}

#[inline(always)]
fn finalize(a: &mut u32, b: &mut u32, c: &mut u32) {
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(14));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(11));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(25));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(16));
    *a ^= *c;
    *a = a.wrapping_sub(c.rotate_left(4));
    *b ^= *a;
    *b = b.wrapping_sub(a.rotate_left(14));
    *c ^= *b;
    *c = c.wrapping_sub(b.rotate_left(24));
}

/// Hash an array of 32-bit words.
pub fn jhash2(k: &[u32], initval: u32) -> u32 {
    let init = JHASH_INITVAL
        .wrapping_add((k.len() as u32) << 2)
        .wrapping_add(initval);
    let (mut a, mut b, mut c) = (init, init, init);

    let mut rest = k;
    while rest.len() > 3 {
        a = a.wrapping_add(rest[0]);
        b = b.wrapping_add(rest[1]);
        c = c.wrapping_add(rest[2]);
        mix(&mut a, &mut b, &mut c);
        rest = &rest[3..];
    }

    match rest.len() {
        3 => {
            c = c.wrapping_add(rest[2]);
            b = b.wrapping_add(rest[1]);
            a = a.wrapping_add(rest[0]);
            finalize(&mut a, &mut b, &mut c);
        }
        2 => {
            b = b.wrapping_add(rest[1]);
            a = a.wrapping_add(rest[0]);
            finalize(&mut a, &mut b, &mut c);
        }
        1 => {
            a = a.wrapping_add(rest[0]);
            finalize(&mut a, &mut b, &mut c);
        }
        _ => {}
    }
    c
}

/// Hash captured frames over their raw bytes, read as little-endian words.
pub fn hash_frames(frames: &[u64]) -> u32 {
    let mut words = [0u32; 2 * super::PERF_MAX_STACK_DEPTH as usize];
    let len = frames.len().min(super::PERF_MAX_STACK_DEPTH as usize);
    for (i, ip) in frames[..len].iter().enumerate() {
        words[2 * i] = *ip as u32;
        words[2 * i + 1] = (*ip >> 32) as u32;
    }
    jhash2(&words[..2 * len], 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_is_initval() {
        assert_eq!(jhash2(&[], 0), JHASH_INITVAL);
        assert_eq!(jhash2(&[], 1), JHASH_INITVAL + 1);
    }

    #[test]
    fn test_deterministic() {
        let frames = [0xffff_8000_1234_5678, 0xffff_8000_0000_1000, 0x42];
        assert_eq!(hash_frames(&frames), hash_frames(&frames));
    }

    #[test]
    fn test_sensitive_to_content_and_length() {
        let a = hash_frames(&[1, 2, 3]);
        let b = hash_frames(&[1, 2, 4]);
        let c = hash_frames(&[1, 2, 3, 0]);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_frames_hash_matches_word_hash() {
        let frames = [0x0000_0002_0000_0001u64, 0x0000_0004_0000_0003];
        assert_eq!(hash_frames(&frames), jhash2(&[1, 2, 3, 4], 0));
    }
}
