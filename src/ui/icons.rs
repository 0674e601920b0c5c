//! Shared status icons with plain-text fallbacks for dumb terminals.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK] ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR] ");
pub static PAUSE: Emoji<'_, '_> = Emoji("⏸️  ", "[PAUSE] ");
pub static SAVE: Emoji<'_, '_> = Emoji("💾 ", "[SAVE] ");
pub static FILE: Emoji<'_, '_> = Emoji("📄 ", "+ ");
pub static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>] ");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "* ");
