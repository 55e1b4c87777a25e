use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current unix time in seconds
pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_secs()
}

// Get current timestamp in milliseconds
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Handshake token for a connection accepted (or re-greeted) at `secs`.
pub fn token_from_secs(secs: u64) -> u16 {
    (secs & 0xFFFF) as u16
}

pub fn handshake_token() -> u16 {
    token_from_secs(unix_seconds())
}

/// Planar distance between two map positions.
pub fn distance(a: (i32, i32), b: (i32, i32)) -> f64 {
    let dx = (a.0 - b.0) as f64;
    let dy = (a.1 - b.1) as f64;
    (dx * dx + dy * dy).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_wraps_at_sixteen_bits() {
        assert_eq!(token_from_secs(0x1_2345), 0x2345);
        assert_eq!(token_from_secs(0xFFFF), 0xFFFF);
        assert_eq!(token_from_secs(0x1_0000), 0);
    }

    #[test]
    fn test_distance() {
        assert_eq!(distance((0, 0), (3, 4)), 5.0);
        assert_eq!(distance((-3, -4), (0, 0)), 5.0);
        assert_eq!(distance((7, 7), (7, 7)), 0.0);
    }

    #[test]
    fn test_clock_moves_forward() {
        let first = unix_millis();
        std::thread::sleep(Duration::from_millis(2));
        assert!(unix_millis() > first);
        assert!(unix_seconds() > 1_600_000_000);
    }
}
