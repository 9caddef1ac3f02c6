//! Password generation for create-on-read secrets.

use rand::rngs::OsRng;
use rand::RngCore;

/// Characters a generated secret value may contain.
const ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*()-_=+,.?/:;{}[]`~";

/// Generate a random password of `length` characters from [`ALPHABET`].
///
/// Bytes are drawn from the operating system's CSPRNG. Rejection sampling
/// keeps the distribution uniform: any byte at or above
/// `256 - (256 % |ALPHABET|)` is discarded instead of being folded back in,
/// which would bias the low end of the alphabet.
pub fn generate(length: usize) -> String {
    let limit = (256 - (256 % ALPHABET.len())) as u8;
    let mut password = String::with_capacity(length);
    let mut buffer = [0u8; 64];

    while password.len() < length {
        OsRng.fill_bytes(&mut buffer);
        for &byte in &buffer {
            if byte >= limit {
                continue;
            }
            password.push(ALPHABET[byte as usize % ALPHABET.len()] as char);
            if password.len() == length {
                break;
            }
        }
    }

    password
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_generate_length() {
        for length in [1, 20, 64, 256] {
            assert_eq!(generate(length).len(), length);
        }
    }

    #[test]
    fn test_generate_alphabet_and_uniformity() {
        // 100k passwords of length 20: every character must come from the
        // alphabet and each character's frequency must sit within 5% of
        // uniform.
        let mut counts: HashMap<char, u64> = HashMap::new();
        let passwords = 100_000usize;
        let length = 20usize;

        for _ in 0..passwords {
            for c in generate(length).chars() {
                assert!(
                    ALPHABET.contains(&(c as u8)),
                    "character {:?} outside the declared alphabet",
                    c
                );
                *counts.entry(c).or_insert(0) += 1;
            }
        }

        let total = (passwords * length) as f64;
        let expected = total / ALPHABET.len() as f64;
        for &byte in ALPHABET {
            let observed = *counts.get(&(byte as char)).unwrap_or(&0) as f64;
            let deviation = (observed - expected).abs() / expected;
            assert!(
                deviation < 0.05,
                "character {:?} deviates {:.2}% from uniform",
                byte as char,
                deviation * 100.0
            );
        }
    }
}
