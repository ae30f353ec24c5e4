/// Session key holding the logged-in user's id.
pub const USER_ID: &str = "user_id";
