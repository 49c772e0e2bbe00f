use subtle::ConstantTimeEq;

/// Compare a supplied password with the expected one without leaking how
/// many leading bytes matched. Length and content are compared separately
/// and both results are always computed.
pub fn passwords_match(expected: &str, supplied: &str) -> bool {
    let expected = expected.as_bytes();
    let supplied = supplied.as_bytes();

    let len_eq = (expected.len() as u64).ct_eq(&(supplied.len() as u64));
    let content_eq = if expected.len() == supplied.len() {
        expected.ct_eq(supplied)
    } else {
        // Scan the supplied bytes anyway; the result is forced false.
        supplied.ct_eq(supplied) & subtle::Choice::from(0)
    };
    bool::from(len_eq & content_eq)
}
