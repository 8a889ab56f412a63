use std::time::Instant;

use image::{imageops::FilterType, RgbaImage};
use ratatui::{
    buffer::Buffer,
    layout::{Alignment, Constraint, Layout, Rect},
    style::{Color, Style, Stylize},
    text::Line,
    widgets::{Block, Paragraph, Widget},
    Frame,
};

use crate::chat::{PortraitState, Session};

const PLANT: [&str; 7] = [
    r"    _  ",
    r"   ( \ ",
    r" _  \ )",
    r"( \_|/ ",
    r" \__|  ",
    r"  [___]",
    r"  \___/",
];
const SPINNER: [char; 4] = ['◐', '◓', '◑', '◒'];

/// Largest size with the image's aspect ratio that fits `cells_w` by `cells_h`
/// terminal cells, two pixels per cell vertically.
pub fn fit(image_w: u32, image_h: u32, cells_w: u16, cells_h: u16) -> (u32, u32) {
    let (max_w, max_h) = (cells_w as u32, cells_h as u32 * 2);
    if image_w == 0 || image_h == 0 || max_w == 0 || max_h == 0 {
        return (0, 0);
    }
    // compare image_w / image_h against max_w / max_h without floats
    if image_w as u64 * max_h as u64 > max_w as u64 * image_h as u64 {
        let h = (max_w as u64 * image_h as u64 / image_w as u64).max(1) as u32;
        (max_w, h)
    } else {
        let w = (max_h as u64 * image_w as u64 / image_h as u64).max(1) as u32;
        (w, max_h)
    }
}

/// Draws an image with `▀`: foreground is the upper pixel, background the lower.
struct HalfBlocks<'a>(&'a RgbaImage);

fn rgb(pixel: &image::Rgba<u8>) -> Color {
    Color::Rgb(pixel[0], pixel[1], pixel[2])
}

impl Widget for HalfBlocks<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let image = self.0;
        let rows = image.height().div_ceil(2);
        let x0 = area.x + (area.width.saturating_sub(image.width() as u16)) / 2;
        let y0 = area.y + (area.height.saturating_sub(rows as u16)) / 2;

        for row in 0..rows.min(area.height as u32) {
            for col in 0..image.width().min(area.width as u32) {
                let top = image.get_pixel(col, row * 2);
                let cell = buf.get_mut(x0 + col as u16, y0 + row as u16);
                cell.set_char('▀').set_fg(rgb(top));
                if row * 2 + 1 < image.height() {
                    cell.set_bg(rgb(image.get_pixel(col, row * 2 + 1)));
                }
            }
        }
    }
}

pub struct PortraitComponent {
    started: Instant,
    scaled: Option<((u16, u16), RgbaImage)>,
}

impl PortraitComponent {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            scaled: None,
        }
    }

    fn scaled<'a>(&'a mut self, image: &'a RgbaImage, area: Rect) -> &'a RgbaImage {
        let key = (area.width, area.height);
        let stale = !matches!(&self.scaled, Some((k, _)) if *k == key);
        if stale {
            let (w, h) = fit(image.width(), image.height(), area.width, area.height);
            let resized = image::imageops::resize(image, w.max(1), h.max(1), FilterType::Triangle);
            self.scaled = Some((key, resized));
        }
        match &self.scaled {
            Some((_, image)) => image,
            None => image,
        }
    }

    fn plant(frame: &mut Frame, area: Rect, style: Style) {
        let lines: Vec<Line> = PLANT.iter().map(|l| Line::styled(*l, style)).collect();
        let top = area.height.saturating_sub(PLANT.len() as u16) / 2;
        let area = Rect {
            y: area.y + top,
            height: area.height - top,
            ..area
        };
        frame.render_widget(Paragraph::new(lines).alignment(Alignment::Center), area);
    }

    pub fn render(&mut self, session: &Session, frame: &mut Frame, area: Rect) {
        let block = Block::bordered().title("彼端").gray();
        let inner = block.inner(area);
        frame.render_widget(block, area);

        let [picture, caption_area, activity_area] = Layout::vertical([
            Constraint::Min(3),
            Constraint::Length(1),
            Constraint::Length(2),
        ])
        .areas(inner);

        let caption = match session.portrait() {
            PortraitState::Placeholder => {
                Self::plant(frame, picture, Style::new().fg(Color::Green));
                Line::styled("一株安静的植物", Style::new().fg(Color::DarkGray))
            }
            PortraitState::Loading => {
                Self::plant(frame, picture, Style::new().fg(Color::DarkGray));
                let i = (self.started.elapsed().as_millis() / 150) as usize % SPINNER.len();
                Line::styled(format!("{} 影像显影中", SPINNER[i]), Style::new().fg(Color::Cyan))
            }
            PortraitState::Failed { caption } => {
                Self::plant(frame, picture, Style::new().fg(Color::DarkGray));
                Line::styled(*caption, Style::new().fg(Color::Red))
            }
            PortraitState::Ready(image) => {
                let scaled = self.scaled(image, picture);
                frame.render_widget(HalfBlocks(scaled), picture);
                Line::styled(
                    session.profile().map(|p| p.name.clone()).unwrap_or_default(),
                    Style::new().fg(Color::Cyan).bold(),
                )
            }
        };
        frame.render_widget(Paragraph::new(caption).alignment(Alignment::Center), caption_area);

        if let Some(profile) = session.profile() {
            frame.render_widget(
                Paragraph::new(profile.current_activity.as_str())
                    .alignment(Alignment::Center)
                    .wrap(ratatui::widgets::Wrap { trim: true })
                    .dark_gray(),
                activity_area,
            );
        }
    }
}
