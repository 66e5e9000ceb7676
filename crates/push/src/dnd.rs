//! Do-not-disturb window arithmetic.

use chrono::NaiveTime;

/// Whether `now` falls inside the `[start, end)` window. Windows may wrap
/// past midnight (`22:00` → `07:00`). Missing or malformed bounds disable
/// the window.
#[must_use]
pub fn in_dnd_window(start: Option<&str>, end: Option<&str>, now: NaiveTime) -> bool {
    let (Some(start), Some(end)) = (start, end) else {
        return false;
    };
    let (Ok(start), Ok(end)) = (
        NaiveTime::parse_from_str(start, "%H:%M"),
        NaiveTime::parse_from_str(end, "%H:%M"),
    ) else {
        return false;
    };

    if start <= end {
        now >= start && now < end
    } else {
        // Wrap-around: active late evening or early morning.
        now >= start || now < end
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn at(hhmm: &str) -> NaiveTime {
        NaiveTime::parse_from_str(hhmm, "%H:%M").unwrap()
    }

    #[test]
    fn plain_window() {
        assert!(in_dnd_window(Some("09:00"), Some("17:00"), at("12:00")));
        assert!(!in_dnd_window(Some("09:00"), Some("17:00"), at("18:00")));
        assert!(!in_dnd_window(Some("09:00"), Some("17:00"), at("17:00")));
    }

    #[test]
    fn wrap_around_window() {
        let start = Some("22:00");
        let end = Some("07:00");
        assert!(in_dnd_window(start, end, at("03:00")));
        assert!(in_dnd_window(start, end, at("23:30")));
        assert!(!in_dnd_window(start, end, at("12:00")));
        assert!(!in_dnd_window(start, end, at("07:00")));
    }

    #[test]
    fn missing_bounds_disable() {
        assert!(!in_dnd_window(None, Some("07:00"), at("03:00")));
        assert!(!in_dnd_window(Some("garbage"), Some("07:00"), at("03:00")));
    }
}
