/// All timestamps are UTC.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Notification sequence numbers. `0` means "nothing seen yet".
pub type SequenceNumber = i64;

/// Convert a `std` duration into a chrono duration, saturating at roughly a
/// century for values chrono cannot represent.
pub fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}
