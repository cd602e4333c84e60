//! Nickname and channel-name rules, plus the generator used to seed new
//! sessions with a free nickname.

use rand::Rng;

/// Nickname the broker itself speaks as.
pub const SERVER_NICK: &str = "SERVER";

/// Placeholder nickname a client holds before its first assignment.
pub const NEW_USER_NICK: &str = "NEWUSER";

/// Names no session may ever hold.
pub const RESERVED: [&str; 2] = [SERVER_NICK, NEW_USER_NICK];

/// Maximum nickname length (channel names get one extra byte for `#`).
pub const MAX_LEN: usize = 10;

/// `[A-Za-z0-9]{1,10}`
pub fn is_valid(name: &str) -> bool {
    (1..=MAX_LEN).contains(&name.len()) && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// `#[A-Za-z0-9]{1,10}`
pub fn is_valid_channel(name: &str) -> bool {
    name.strip_prefix('#').is_some_and(is_valid)
}

pub fn is_reserved(name: &str) -> bool {
    RESERVED.contains(&name)
}

const ADJECTIVES: &[&str] = &[
    "amber", "bold", "brisk", "calm", "clever", "dusty", "eager", "fuzzy", "glad", "happy",
    "keen", "lucky", "mellow", "nimble", "odd", "plucky", "quick", "rusty", "shiny", "spry",
    "tidy", "vivid", "warm", "zesty",
];

const ANIMALS: &[&str] = &[
    "ant", "bat", "bee", "crab", "crow", "deer", "dove", "eel", "fox", "gull", "hare", "ibis",
    "koi", "lark", "mole", "newt", "otter", "pike", "quail", "seal", "toad", "vole", "wren",
    "yak",
];

/// Generate a fresh nickname: two lowercase words truncated to 9 characters,
/// retried until one is neither reserved nor claimed by `in_use`. Later
/// attempts mix in a numeric suffix so a crowded registry still converges.
/// Returns `None` only when the name space is effectively exhausted.
pub fn generate(in_use: impl Fn(&str) -> bool) -> Option<String> {
    let mut rng = rand::thread_rng();
    for attempt in 0..1024 {
        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let animal = ANIMALS[rng.gen_range(0..ANIMALS.len())];
        let mut name = format!("{adjective}{animal}");
        name.truncate(9);
        if attempt >= 32 {
            name.truncate(6);
            name.push_str(&rng.gen_range(0..1000u32).to_string());
        }
        if !is_reserved(&name) && !in_use(&name) {
            return Some(name);
        }
    }
    None
}
