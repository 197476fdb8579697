/// Classifies an HTTP exchange into transport-level and user-level success.
/// Pure; the pattern list is a design constant.
pub struct SuccessValidator;

const ERROR_PATTERNS: [&str; 5] = [
    "blocked",
    "forbidden",
    "access denied",
    "error 403",
    "error 404",
];

impl SuccessValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate_http(&self, status: u16, body: &[u8]) -> (bool, bool) {
        let network_success = (200..400).contains(&status);
        if !network_success {
            return (false, false);
        }

        // An empty body proves nothing about the content; only a body free of
        // gating markers counts as user-level success.
        let user_success = if body.is_empty() {
            false
        } else {
            let content = printable_lowercase(body);
            !ERROR_PATTERNS.iter().any(|p| content.contains(p))
        };

        (network_success, user_success)
    }
}

impl Default for SuccessValidator {
    fn default() -> Self {
        Self::new()
    }
}

// Printable view of possibly non-UTF8 bytes.
fn printable_lowercase(body: &[u8]) -> String {
    body.iter()
        .filter(|&&b| (32..127).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
        .map(|&b| (b as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_bounds_define_network_success() {
        let v = SuccessValidator::new();
        assert_eq!(v.validate_http(200, b"ok page"), (true, true));
        assert_eq!(v.validate_http(301, b"moved over here"), (true, true));
        assert_eq!(v.validate_http(199, b"ok"), (false, false));
        assert_eq!(v.validate_http(403, b"ok"), (false, false));
        assert_eq!(v.validate_http(500, b"ok"), (false, false));
    }

    #[test]
    fn gating_markers_defeat_user_success() {
        let v = SuccessValidator::new();
        assert_eq!(v.validate_http(200, b"<h1>Access Denied</h1>"), (true, false));
        assert_eq!(v.validate_http(200, b"request BLOCKED by policy"), (true, false));
        assert_eq!(v.validate_http(200, b"Error 403 while fetching"), (true, false));
        assert_eq!(v.validate_http(200, b"forbidden fruit"), (true, false));
    }

    #[test]
    fn empty_body_is_not_user_success() {
        let v = SuccessValidator::new();
        assert_eq!(v.validate_http(204, b""), (true, false));
    }

    #[test]
    fn non_utf8_bytes_do_not_hide_markers() {
        let v = SuccessValidator::new();
        let mut body = vec![0xFF, 0xFE, 0x00];
        body.extend_from_slice(b"acc");
        body.push(0x80);
        body.extend_from_slice(b"ess denied");
        // The unprintable bytes are dropped, leaving "access denied".
        assert_eq!(v.validate_http(200, &body), (true, false));
    }

    #[test]
    fn validator_is_pure() {
        let v = SuccessValidator::new();
        let first = v.validate_http(200, b"plain content");
        let second = v.validate_http(200, b"plain content");
        assert_eq!(first, second);
        assert_eq!(first, (true, true));
    }
}
