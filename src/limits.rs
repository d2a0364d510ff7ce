/// Max bytes for a first name, last name or email.
pub const MAX_NAME_LEN: usize = 256;

/// Widest window a listing query may ask for.
pub const MAX_LISTING_DAYS: u32 = 366;

/// Max live reservations held by one store.
pub const MAX_RESERVATIONS: usize = 100_000;

/// Max concurrent client connections unless configured otherwise.
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
