/// Scatters `source` into `target` by the byte of each key selected by `shift`.
/// `indices` holds the running start offset of each bucket and is advanced in place.
fn reorder_for_byte(source: &[u64], target: &mut [u64], indices: &mut [usize; 256], shift: u32) {
    for &key in source {
        let bucket_start_index = &mut indices[((key >> shift) & 0xFF) as usize];
        target[*bucket_start_index] = key;
        *bucket_start_index += 1;
    }
}

/// Converts bucket counts into exclusive prefix sums.
fn calculate_partial_sums(bucket_counts: &mut [usize; 256]) {
    let mut sum = 0;
    for bucket in bucket_counts.iter_mut() {
        let count = *bucket;
        *bucket = sum;
        sum += count;
    }
}

/// Sorts 64-bit keys in ascending order, least significant byte first.
///
/// `scratch` must be at least as long as `keys`. Passes whose byte is the same for every key
/// are skipped; the sorted keys always end up in `keys`.
pub fn sort_u64(keys: &mut [u64], scratch: &mut [u64]) {
    debug_assert!(
        scratch.len() >= keys.len(),
        "Scratch space must hold every key."
    );
    let key_count = keys.len();
    if key_count < 2 {
        return;
    }
    let scratch = &mut scratch[..key_count];

    let mut bucket_counts = [[0usize; 256]; 8];
    for &key in keys.iter() {
        for (byte, counts) in bucket_counts.iter_mut().enumerate() {
            counts[((key >> (byte * 8)) & 0xFF) as usize] += 1;
        }
    }

    let mut sorted_in_scratch = false;
    for (byte, counts) in bucket_counts.iter_mut().enumerate() {
        if counts.iter().any(|&count| count == key_count) {
            continue;
        }
        calculate_partial_sums(counts);
        let shift = byte as u32 * 8;
        if sorted_in_scratch {
            reorder_for_byte(scratch, keys, counts, shift);
        } else {
            reorder_for_byte(keys, scratch, counts, shift);
        }
        sorted_in_scratch = !sorted_in_scratch;
    }
    if sorted_in_scratch {
        keys.copy_from_slice(scratch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_sort_u64_matches_std() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut keys: Vec<u64> = (0..5000).map(|_| rng.gen()).collect();
        let mut expected = keys.clone();
        expected.sort_unstable();
        let mut scratch = vec![0; keys.len()];
        sort_u64(&mut keys, &mut scratch);
        assert_eq!(keys, expected);
    }

    #[test]
    fn test_sort_u64_skips_constant_bytes() {
        // Only the low and high bytes differ; six passes are skipped.
        let mut keys: Vec<u64> = (0..300u64).rev().map(|i| (i << 56) | (i & 0xFF)).collect();
        let mut expected = keys.clone();
        expected.sort_unstable();
        let mut scratch = vec![0; keys.len()];
        sort_u64(&mut keys, &mut scratch);
        assert_eq!(keys, expected);
    }
}
