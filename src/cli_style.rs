use clap::builder::styling::{AnsiColor, Color, Style};
use clap::builder::Styles;
use crossterm::style::{Attribute, Stylize};

// ═══════════════════════════════════════════════════════════════════════════════
// Clap Styles
// ═══════════════════════════════════════════════════════════════════════════════

pub fn get_styles() -> Styles {
    Styles::styled()
        .usage(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Magenta))),
        )
        .header(
            Style::new()
                .bold()
                .underline()
                .fg_color(Some(Color::Ansi(AnsiColor::Magenta))),
        )
        .literal(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Yellow))),
        )
        .invalid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .error(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Red))),
        )
        .valid(
            Style::new()
                .bold()
                .fg_color(Some(Color::Ansi(AnsiColor::Green))),
        )
        .placeholder(Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Color Palette - Marquee Theme
// ═══════════════════════════════════════════════════════════════════════════════

pub mod colors {
    use crossterm::style::Color;

    pub const GOLD: Color = Color::Rgb {
        r: 255,
        g: 196,
        b: 0,
    };
    pub const CRIMSON: Color = Color::Rgb {
        r: 220,
        g: 20,
        b: 60,
    };
    pub const AMBER: Color = Color::Rgb {
        r: 255,
        g: 140,
        b: 0,
    };
    pub const GREEN: Color = Color::Rgb {
        r: 0,
        g: 230,
        b: 118,
    };
    pub const RED: Color = Color::Rgb {
        r: 255,
        g: 85,
        b: 85,
    };
    pub const SKY: Color = Color::Rgb {
        r: 100,
        g: 181,
        b: 246,
    };
    pub const DIM: Color = Color::Rgb {
        r: 128,
        g: 128,
        b: 128,
    };
    pub const WHITE: Color = Color::Rgb {
        r: 255,
        g: 255,
        b: 255,
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// Box Drawing Characters
// ═══════════════════════════════════════════════════════════════════════════════

pub mod box_chars {
    pub const ROUND_TOP_LEFT: &str = "╭";
    pub const ROUND_TOP_RIGHT: &str = "╮";
    pub const ROUND_BOTTOM_LEFT: &str = "╰";
    pub const ROUND_BOTTOM_RIGHT: &str = "╯";
    pub const SINGLE_HORIZONTAL: &str = "─";

    pub const BULLET: &str = "•";
    pub const BULLET_EMPTY: &str = "○";
    pub const STAR: &str = "★";
    pub const ARROW_RIGHT: &str = "▸";
    pub const CHECK: &str = "✓";
    pub const CROSS_MARK: &str = "✗";
}

const SECTION_WIDTH: usize = 60;

// ═══════════════════════════════════════════════════════════════════════════════
// Welcome
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_welcome(backend_url: &str) {
    println!();
    println!(
        "  {} {}",
        "🎬".with(colors::GOLD),
        "Lumajoyaron".with(colors::GOLD).bold()
    );
    println!(
        "  {} {}",
        "Backend:".with(colors::DIM),
        backend_url.with(colors::WHITE)
    );
    println!(
        "  {}",
        "Type 'help' to see the available commands."
            .with(colors::DIM)
            .attribute(Attribute::Italic)
    );
    println!();
}

pub fn print_goodbye() {
    println!();
    println!(
        "  {} {}",
        "🍿".with(colors::GOLD),
        "See you at the next screening.".with(colors::AMBER).bold()
    );
    println!();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Indicators
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_success(message: &str) {
    println!(
        " {} {}",
        box_chars::CHECK.with(colors::GREEN).bold(),
        message.with(colors::GREEN)
    );
}

pub fn print_error(message: &str) {
    println!(
        " {} {}",
        box_chars::CROSS_MARK.with(colors::RED).bold(),
        message.with(colors::RED)
    );
}

pub fn print_warning(message: &str) {
    println!(
        " {} {}",
        "⚠".with(colors::AMBER).bold(),
        message.with(colors::AMBER)
    );
}

pub fn print_info(message: &str) {
    println!(
        " {} {}",
        "ℹ".with(colors::SKY).bold(),
        message.with(colors::SKY)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Section Headers
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_section_header(title: &str) {
    let title_len = title.chars().count();
    let padding = SECTION_WIDTH.saturating_sub(title_len + 4) / 2;

    println!();
    print!("{}", box_chars::ROUND_TOP_LEFT.with(colors::CRIMSON));
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(padding)
            .with(colors::CRIMSON)
    );
    print!(" {} ", title.with(colors::GOLD).bold());
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(SECTION_WIDTH.saturating_sub(title_len + 4 + padding))
            .with(colors::CRIMSON)
    );
    println!("{}", box_chars::ROUND_TOP_RIGHT.with(colors::CRIMSON));
}

pub fn print_section_footer() {
    print!("{}", box_chars::ROUND_BOTTOM_LEFT.with(colors::CRIMSON));
    print!(
        "{}",
        box_chars::SINGLE_HORIZONTAL
            .repeat(SECTION_WIDTH)
            .with(colors::CRIMSON)
    );
    println!("{}", box_chars::ROUND_BOTTOM_RIGHT.with(colors::CRIMSON));
    println!();
}

// ═══════════════════════════════════════════════════════════════════════════════
// Key-Value Display
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_key_value(key: &str, value: &str) {
    println!(
        "  {} {} {}",
        box_chars::BULLET.with(colors::CRIMSON),
        format!("{}:", key).with(colors::DIM),
        value.with(colors::WHITE)
    );
}

pub fn print_key_value_highlight(key: &str, value: &str) {
    println!(
        "  {} {} {}",
        box_chars::STAR.with(colors::GOLD),
        format!("{}:", key).with(colors::GOLD).bold(),
        value.with(colors::GREEN).bold()
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// List Display
// ═══════════════════════════════════════════════════════════════════════════════

pub fn print_list_item(item: &str, indent: usize) {
    let indent_str = "  ".repeat(indent);
    println!(
        "{}{}  {}",
        indent_str,
        box_chars::ARROW_RIGHT.with(colors::GOLD),
        item.with(colors::WHITE)
    );
}

pub fn print_empty_list(message: &str) {
    println!(
        "  {} {}",
        box_chars::BULLET_EMPTY.with(colors::DIM),
        message.with(colors::DIM).attribute(Attribute::Italic)
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Prompt Styling
// ═══════════════════════════════════════════════════════════════════════════════

/// Prompt showing who is signed in, if anyone.
pub fn get_prompt(user: Option<&str>) -> String {
    match user {
        Some(name) => format!(
            "{} {} ",
            name.with(colors::GOLD),
            "▶".with(colors::CRIMSON).bold()
        ),
        None => format!("{} ", "▶".with(colors::CRIMSON).bold()),
    }
}
