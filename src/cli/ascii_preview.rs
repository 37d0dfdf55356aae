use std::io::{self, Write};
use std::time::Duration;

use crossterm::{
    cursor,
    event::{self, Event, KeyCode, KeyEvent},
    terminal::{self, ClearType},
};
use image::DynamicImage;

use crate::core::detector::FaceBox;

const ASCII_RAMP: &str = " .·:;+=xX#@";
const DEFAULT_WIDTH: usize = 80;
const DEFAULT_HEIGHT: usize = 30;

/// Terminal rendering of the camera stream with the face box, the current
/// guidance and capture progress.
pub struct AsciiRenderer {
    width: usize,
    height: usize,
}

impl AsciiRenderer {
    pub fn new(width: Option<usize>, height: Option<usize>) -> Self {
        let (term_width, term_height) = terminal::size()
            .map(|(w, h)| (w as usize, h as usize))
            .unwrap_or((DEFAULT_WIDTH, DEFAULT_HEIGHT));

        // Half resolution keeps redraws cheap
        Self {
            width: width.unwrap_or((term_width / 2).min(DEFAULT_WIDTH / 2)).max(8),
            height: height.unwrap_or((term_height.saturating_sub(5) / 2).min(DEFAULT_HEIGHT / 2)).max(4),
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Renders one frame. The status lines go below the picture so they stay
    /// readable when no face is visible.
    pub fn render(
        &self,
        image: &DynamicImage,
        face: Option<&FaceBox>,
        message: &str,
        captured: usize,
        target: usize,
    ) -> String {
        let mut grid = self.image_to_ascii(image);
        if let Some(face) = face {
            self.draw_face_box(&mut grid, face, image.width() as f32, image.height() as f32);
        }

        let mut lines = self.grid_to_lines(&grid);
        lines.push(format!("{} {}", progress_bar(captured, target), message));
        lines.join("\r\n")
    }

    fn image_to_ascii(&self, image: &DynamicImage) -> Vec<Vec<char>> {
        let mut grid = vec![vec![' '; self.width]; self.height];
        let ramp: Vec<char> = ASCII_RAMP.chars().collect();

        let gray = image.to_luma8();
        let (img_width, img_height) = gray.dimensions();

        for (term_y, row) in grid.iter_mut().enumerate() {
            for (term_x, cell) in row.iter_mut().enumerate() {
                let img_x = (term_x as f32 / self.width as f32 * img_width as f32) as u32;
                let img_y = (term_y as f32 / self.height as f32 * img_height as f32) as u32;

                if img_x < img_width && img_y < img_height {
                    let brightness = gray.get_pixel(img_x, img_y)[0] as usize;
                    *cell = ramp[brightness * (ramp.len() - 1) / 255];
                }
            }
        }

        grid
    }

    fn draw_face_box(&self, grid: &mut [Vec<char>], face: &FaceBox, img_width: f32, img_height: f32) {
        let scale_x = |x: f32| (((x / img_width) * self.width as f32).max(0.0) as usize).min(self.width - 1);
        let scale_y = |y: f32| (((y / img_height) * self.height as f32).max(0.0) as usize).min(self.height - 1);

        let (x1, x2) = (scale_x(face.x1), scale_x(face.x2));
        let (y1, y2) = (scale_y(face.y1), scale_y(face.y2));
        if x2 <= x1 || y2 <= y1 {
            return;
        }

        for x in (x1 + 1)..x2 {
            grid[y1][x] = '─';
            grid[y2][x] = '─';
        }
        for row in grid.iter_mut().take(y2).skip(y1 + 1) {
            row[x1] = '│';
            row[x2] = '│';
        }
        grid[y1][x1] = '┌';
        grid[y1][x2] = '┐';
        grid[y2][x1] = '└';
        grid[y2][x2] = '┘';
    }

    fn grid_to_lines(&self, grid: &[Vec<char>]) -> Vec<String> {
        grid.iter().map(|row| row.iter().take(self.width).collect()).collect()
    }
}

/// One box per capture, e.g. `[■■□□]`.
pub fn progress_bar(captured: usize, target: usize) -> String {
    let filled = "■".repeat(captured.min(target));
    let empty = "□".repeat(target.saturating_sub(captured));
    format!("[{}{}]", filled, empty)
}

/// Redraws from the top-left corner; the screen was cleared once before.
pub fn draw_at_top(frame: &str) -> io::Result<()> {
    let mut out = io::stdout();
    crossterm::execute!(out, cursor::MoveTo(0, 0))?;
    for line in frame.split("\r\n") {
        crossterm::execute!(out, terminal::Clear(ClearType::CurrentLine))?;
        write!(out, "{}\r\n", line)?;
    }
    out.flush()
}

pub fn clear_screen() -> io::Result<()> {
    crossterm::execute!(io::stdout(), terminal::Clear(ClearType::All), cursor::MoveTo(0, 0))?;
    io::stdout().flush()
}

pub fn check_for_escape() -> io::Result<bool> {
    if event::poll(Duration::from_millis(0))? {
        if let Event::Key(KeyEvent { code, .. }) = event::read()? {
            return Ok(code == KeyCode::Esc);
        }
    }
    Ok(false)
}
