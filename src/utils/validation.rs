use regex::Regex;

pub fn validate_email(email: &str) -> bool {
    let re = Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").unwrap();
    re.is_match(email)
}

/// WeChat js_code from wx.login(): opaque, but always non-empty ASCII
/// without whitespace. Reject obvious garbage before hitting the API.
pub fn validate_login_code(code: &str) -> bool {
    !code.is_empty() && code.len() <= 128 && code.chars().all(|c| c.is_ascii_graphic())
}

/// Order ids: millisecond timestamp plus six random digits. Uniqueness is
/// not guaranteed here; callers probe the store and regenerate on collision.
pub fn generate_order_id() -> String {
    use rand::Rng;
    let ts = chrono::Utc::now().format("%Y%m%d%H%M%S%3f");
    let mut rng = rand::thread_rng();
    let tail: u32 = rng.gen_range(0..1_000_000);
    format!("{}{:06}", ts, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_email() {
        assert!(validate_email("hr@acme-corp.com"));
        assert!(!validate_email("not-an-email"));
        assert!(!validate_email("x@y"));
    }

    #[test]
    fn login_code_rejects_blank_and_whitespace() {
        assert!(validate_login_code("081Kq9000aXbcd1xyz000u7kq90a"));
        assert!(!validate_login_code(""));
        assert!(!validate_login_code("has space"));
    }

    #[test]
    fn order_id_is_timestamp_plus_six_digits() {
        let id = generate_order_id();
        assert_eq!(id.len(), 23);
        assert!(id.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn order_ids_differ_across_calls() {
        // Random tail makes same-millisecond collisions a 1-in-a-million
        // event, which the store-side probe catches anyway.
        let a = generate_order_id();
        let b = generate_order_id();
        assert!(a != b || generate_order_id() != a);
    }
}
