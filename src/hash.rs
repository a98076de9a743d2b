use std::hash::Hash;

use siphasher::sip128::{Hasher128, SipHasher13};

/// Produce a 128-bit fingerprint of a value.
///
/// Used wherever two versions of a structure are compared by content rather
/// than by identity, e.g. suggestions before and after a recompilation.
#[inline]
pub fn fingerprint<T: Hash + ?Sized>(value: &T) -> u128 {
    let mut state = SipHasher13::new();
    value.hash(&mut state);
    state.finish128().as_u128()
}
