//! Fixed reply texts (WhatsApp-style `*bold*` markup).

use crate::domain::GroupParticipant;

pub const MENU_TEXT: &str = "🤖 *TERMUX BOT MENU*

!menu
!ping
!admins
!promote <groupJid> <number>
!demote <groupJid> <number>

⚠️ Admin commands work only if YOU are admin";

pub const PONG_TEXT: &str = "🏓 Pong! Bot Alive";

pub const PAIRING_QUESTION: &str = "Enter your WhatsApp Number (e.g., 923xxxxxxxxx): ";

pub const PAIRING_INSTRUCTIONS: &str = "WhatsApp → Linked Devices → Link a Device → Enter Code";

/// Render the administrators of a group as a bulleted list of bare numbers.
pub fn format_admin_list(participants: &[GroupParticipant]) -> String {
    let admins = participants
        .iter()
        .filter(|p| p.is_admin())
        .map(|p| format!("• {}", p.id.user()))
        .collect::<Vec<_>>()
        .join("\n");

    format!("👮 *Group Admins*\n\n{admins}")
}

/// Cut `s` to `max_len` chars, marking the cut with `...`.
pub fn truncate_text(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let mut out = s.chars().take(max_len).collect::<String>();
    out.push_str("...");
    out
}
