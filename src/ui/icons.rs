//! Emoji used by the terminal output, with plain fallbacks for terminals
//! that can't render them.

use console::Emoji;

pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "[!]");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "*");

// Stages
pub static DRAFT: Emoji<'_, '_> = Emoji("🖋️  ", "[D]");
pub static EDIT: Emoji<'_, '_> = Emoji("📝 ", "[E]");
pub static REVIEW: Emoji<'_, '_> = Emoji("🔍 ", "[R]");
pub static MEMORY: Emoji<'_, '_> = Emoji("🧠 ", "[M]");

pub static AUDIT: Emoji<'_, '_> = Emoji("📊 ", "[A]");
pub static RETRY: Emoji<'_, '_> = Emoji("🔄 ", "[~]");
