use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_filled_rect_mut, draw_hollow_rect_mut},
    rect::Rect,
};
use ml_core::{Detection, DetectionBatch};

const BOX_THICKNESS: i32 = 2;
const GLYPH_WIDTH: i32 = 5;
const GLYPH_HEIGHT: i32 = 7;
const GLYPH_ADVANCE: i32 = GLYPH_WIDTH + 1;
const LABEL_PADDING: i32 = 2;

const PALETTE: [[u8; 3]; 10] = [
    [56, 56, 255],
    [151, 157, 255],
    [31, 112, 255],
    [29, 178, 255],
    [49, 210, 207],
    [10, 249, 72],
    [23, 204, 146],
    [134, 219, 61],
    [52, 147, 26],
    [187, 212, 0],
];

/// Box colour for a class id; stable across frames.
pub(crate) fn class_color(class_id: i64) -> Rgb<u8> {
    let idx = class_id.rem_euclid(PALETTE.len() as i64) as usize;
    Rgb(PALETTE[idx])
}

/// Caption drawn above each box, e.g. `PERSON 87%`.
pub(crate) fn caption(detection: &Detection) -> String {
    format!(
        "{} {:.0}%",
        detection.label().to_uppercase(),
        (detection.score * 100.0).clamp(0.0, 100.0)
    )
}

/// Draw every detection in `batch` onto `image`.
pub(crate) fn annotate(mut image: RgbImage, batch: &DetectionBatch) -> RgbImage {
    if image.width() == 0 || image.height() == 0 {
        return image;
    }
    for detection in &batch.detections {
        draw_detection(&mut image, detection);
    }
    image
}

fn draw_detection(image: &mut RgbImage, detection: &Detection) {
    let max_x = image.width() as f32 - 1.0;
    let max_y = image.height() as f32 - 1.0;
    let left = detection.bbox[0].clamp(0.0, max_x).round() as i32;
    let top = detection.bbox[1].clamp(0.0, max_y).round() as i32;
    let right = detection.bbox[2].clamp(0.0, max_x).round() as i32;
    let bottom = detection.bbox[3].clamp(0.0, max_y).round() as i32;
    if right <= left || bottom <= top {
        return;
    }

    let color = class_color(detection.class_id);
    for inset in 0..BOX_THICKNESS {
        let width = right - left - 2 * inset;
        let height = bottom - top - 2 * inset;
        if width <= 0 || height <= 0 {
            break;
        }
        draw_hollow_rect_mut(
            image,
            Rect::at(left + inset, top + inset).of_size(width as u32 + 1, height as u32 + 1),
            color,
        );
    }

    let text = caption(detection);
    let label_width = text.chars().count() as i32 * GLYPH_ADVANCE + LABEL_PADDING * 2;
    let label_height = GLYPH_HEIGHT + LABEL_PADDING * 2;
    // Sit above the box when there is room, otherwise just inside it.
    let label_top = if top >= label_height {
        top - label_height
    } else {
        top
    };
    draw_filled_rect_mut(
        image,
        Rect::at(left, label_top).of_size(label_width as u32, label_height as u32),
        color,
    );
    draw_text(
        image,
        left + LABEL_PADDING,
        label_top + LABEL_PADDING,
        &text,
        text_color(color),
    );
}

fn text_color(background: Rgb<u8>) -> Rgb<u8> {
    let [r, g, b] = background.0;
    let luma = 299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b);
    if luma > 140_000 {
        Rgb([0, 0, 0])
    } else {
        Rgb([255, 255, 255])
    }
}

fn draw_text(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let (width, height) = (image.width() as i32, image.height() as i32);
    for ch in text.chars().flat_map(char::to_uppercase) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..GLYPH_WIDTH {
                    let px = x + col;
                    if (pattern >> (GLYPH_WIDTH - 1 - col)) & 1 == 1 && px >= 0 && px < width {
                        image.put_pixel(px as u32, py as u32, color);
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b01110, 0b00001, 0b00001, 0b10001, 0b01110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '%' => [0b11001, 0b11010, 0b00010, 0b00100, 0b01000, 0b01011, 0b10011],
        '.' => [0, 0, 0, 0, 0, 0b01100, 0b01100],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
