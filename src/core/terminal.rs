use console::{Emoji, style};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");
pub static SPARKLE: Emoji<'_, '_> = Emoji("✨ ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_warn(msg: &str) {
    eprintln!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_status(label: &str, msg: &str) {
    println!("  {} {}: {}", GEAR, style(label).bold().cyan(), msg);
}

pub fn print_step(step: &str) {
    println!("{} {}", SPARKLE, style(step).bold());
}

/// A titled block of aligned rows for help and status screens.
pub struct GuideSection {
    title: String,
    rows: Vec<GuideRow>,
}

enum GuideRow {
    Command(String, String),
    Status(String, String),
    Text(String),
    Blank,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, description: &str) -> Self {
        self.rows
            .push(GuideRow::Command(name.to_string(), description.to_string()));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows
            .push(GuideRow::Status(label.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, line: &str) -> Self {
        self.rows.push(GuideRow::Text(line.to_string()));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(GuideRow::Blank);
        self
    }

    pub fn render(&self) -> Vec<String> {
        let width = self
            .rows
            .iter()
            .filter_map(|row| match row {
                GuideRow::Command(name, _) => Some(name.chars().count()),
                _ => None,
            })
            .max()
            .unwrap_or(0);

        let mut lines = vec![format!(" {}", style(&self.title).bold().underlined())];
        for row in &self.rows {
            lines.push(match row {
                GuideRow::Command(name, description) => format!(
                    "   {}{}  {}",
                    style(name).green(),
                    " ".repeat(width - name.chars().count()),
                    style(description).dim()
                ),
                GuideRow::Status(label, value) => {
                    format!("   {}: {}", style(label).bold().cyan(), value)
                }
                GuideRow::Text(line) => format!("   {}", line),
                GuideRow::Blank => String::new(),
            });
        }
        lines
    }

    pub fn print(&self) {
        println!();
        for line in self.render() {
            println!("{}", line);
        }
    }
}

pub fn print_banner() {
    let lines: &[&str] = &[
        "           _           _  __                       ",
        " _ __ ___ (_)_ __   __| |/ _| ___  _ __ __ _  ___  ",
        "| '_ ` _ \\| | '_ \\ / _` | |_ / _ \\| '__/ _` |/ _ \\ ",
        "| | | | | | | | | | (_| |  _| (_) | | | (_| |  __/ ",
        "|_| |_| |_|_|_| |_|\\__,_|_|  \\___/|_|  \\__, |\\___| ",
        "                                       |___/       ",
    ];

    // Gradient: #f59e0b → #f97316 → #ef4444 (diagonal top-left → bottom-right)
    let stops: [(u8, u8, u8); 3] = [(245, 158, 11), (249, 115, 22), (239, 68, 68)];
    let max_w = 52u32;
    let max_d = max_w + 5 * 10;

    println!();
    for (y, line) in lines.iter().enumerate() {
        for (x, ch) in line.chars().enumerate() {
            if ch == ' ' {
                print!(" ");
                continue;
            }
            let d = ((x as u32 + y as u32 * 10) * 1000 / max_d).min(1000);
            let (r, g, b) = if d <= 500 {
                lerp_color(stops[0], stops[1], d * 2)
            } else {
                lerp_color(stops[1], stops[2], (d - 500) * 2)
            };
            print!("\x1b[38;2;{};{};{}m{}", r, g, b, ch);
        }
        println!();
    }
    print!("\x1b[0m");

    println!("\x1b[38;2;239;68;68mEvery step the agent takes, laid out.\x1b[0m\n");
}

fn lerp_color(a: (u8, u8, u8), b: (u8, u8, u8), t: u32) -> (u8, u8, u8) {
    let r = (a.0 as u32 * (1000 - t) + b.0 as u32 * t) / 1000;
    let g = (a.1 as u32 * (1000 - t) + b.1 as u32 * t) / 1000;
    let b_val = (a.2 as u32 * (1000 - t) + b.2 as u32 * t) / 1000;
    (r as u8, g as u8, b_val as u8)
}
