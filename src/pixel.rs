//! Pixel addressing and per-pixel gain configuration of the 64 x 64 array.

use log::{info, warn};
use std::{collections::BTreeSet, fmt, str::FromStr, time::Duration};

use crate::{
    context::DeviceContext,
    error::{DaqError, Result},
};

pub const ROWS: usize = 64;
pub const COLS: usize = 64;
pub const TOTAL_PIXELS: usize = ROWS * COLS;

pub fn pixel_to_rowcol(index: usize) -> (usize, usize) {
    (index / COLS, index % COLS)
}

pub fn rowcol_to_pixel(row: usize, col: usize) -> usize {
    row * COLS + col
}

/// Four-digit `RRCC` code used in stimulation site lists, 1-indexed.
pub fn site_code(row: usize, col: usize) -> u32 {
    ((row + 1) * 100 + (col + 1)) as u32
}

pub fn parse_site_code(code: u32) -> Option<(usize, usize)> {
    let (r, c) = ((code / 100) as usize, (code % 100) as usize);
    if (1..=ROWS).contains(&r) && (1..=COLS).contains(&c) {
        Some((r - 1, c - 1))
    } else {
        None
    }
}

/// Preset 38-bit configuration words for the pixel front-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainMode {
    Buffer,
    GainX40,
    GainX100,
    GainX300,
    GainX40InvBio,
    GainX100InvBio,
    GainX300InvBio,
    DeviceTest,
}

impl GainMode {
    pub const ALL: [GainMode; 8] = [
        GainMode::Buffer,
        GainMode::GainX40,
        GainMode::GainX100,
        GainMode::GainX300,
        GainMode::GainX40InvBio,
        GainMode::GainX100InvBio,
        GainMode::GainX300InvBio,
        GainMode::DeviceTest,
    ];

    pub fn config_word(self) -> u64 {
        match self {
            GainMode::Buffer => 0x24_0001_7003,
            GainMode::GainX40 => 0x24_2001_4E91,
            GainMode::GainX100 => 0x24_2001_4691,
            GainMode::GainX300 => 0x24_2001_4291,
            GainMode::GainX40InvBio => 0x24_2001_4F43,
            GainMode::GainX100InvBio => 0x24_2001_4743,
            GainMode::GainX300InvBio => 0x24_2001_4343,
            GainMode::DeviceTest => 0x24_0001_4E83,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            GainMode::Buffer => "Buffer Mode",
            GainMode::GainX40 => "GainX40",
            GainMode::GainX100 => "GainX100",
            GainMode::GainX300 => "GainX300",
            GainMode::GainX40InvBio => "GainX40_Inv_Bio",
            GainMode::GainX100InvBio => "GainX100_Inv_Bio",
            GainMode::GainX300InvBio => "GainX300_Inv_Bio",
            GainMode::DeviceTest => "Device_Test",
        }
    }
}

impl fmt::Display for GainMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for GainMode {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self> {
        GainMode::ALL
            .iter()
            .copied()
            .find(|m| m.label().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DaqError::InvalidArgument(format!("unknown gain mode {}", s)))
    }
}

/// Split a 38-bit configuration word into the two halves expected by
/// `config_data_write`: the upper 6 bits first, then the lower 32 bits.
pub fn split_config_word(word: u64) -> (u32, u32) {
    ((word >> 32) as u32, (word & 0xFFFF_FFFF) as u32)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelGroup {
    pub name: String,
    pub pixels: Vec<usize>,
    pub config_word: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PixelConfigSummary {
    pub gain_mode: GainMode,
    pub config_word: u64,
    pub groups: usize,
    pub group_pixels: usize,
}

pub struct PixelController {
    ctx: DeviceContext,
    selected: BTreeSet<usize>,
    gain_mode: GainMode,
    groups: Vec<PixelGroup>,
}

fn to_addresses(pixels: &[usize]) -> Vec<(u32, u32)> {
    pixels
        .iter()
        .map(|&p| {
            let (r, c) = pixel_to_rowcol(p);
            (r as u32, c as u32)
        })
        .collect()
}

impl PixelController {
    pub fn new(ctx: DeviceContext) -> Self {
        Self {
            ctx,
            selected: BTreeSet::new(),
            gain_mode: GainMode::DeviceTest,
            groups: Vec::new(),
        }
    }

    pub fn selected(&self) -> &BTreeSet<usize> {
        &self.selected
    }

    pub fn gain_mode(&self) -> GainMode {
        self.gain_mode
    }

    pub fn groups(&self) -> &[PixelGroup] {
        &self.groups
    }

    pub fn select_pixels(&mut self, pixels: &[usize]) -> Result<usize> {
        if let Some(&bad) = pixels.iter().find(|&&p| p >= TOTAL_PIXELS) {
            return Err(DaqError::InvalidArgument(format!(
                "pixel {} is outside 0..{}",
                bad, TOTAL_PIXELS
            )));
        }
        self.ctx
            .device()
            .pixel_sel_write_multiple(&to_addresses(pixels))?;
        self.selected = pixels.iter().copied().collect();
        info!("Selected {} pixels", self.selected.len());
        Ok(self.selected.len())
    }

    pub fn select_all(&mut self) -> Result<usize> {
        self.ctx
            .device()
            .pixel_sel_write_all(ROWS as u32, COLS as u32)?;
        self.selected = (0..TOTAL_PIXELS).collect();
        Ok(TOTAL_PIXELS)
    }

    /// Select the rectangle spanned by the inclusive row and column bounds.
    pub fn select_region(
        &mut self,
        row_start: usize,
        row_end: usize,
        col_start: usize,
        col_end: usize,
    ) -> Result<usize> {
        if row_start > row_end || col_start > col_end || row_end >= ROWS || col_end >= COLS {
            return Err(DaqError::InvalidArgument(format!(
                "invalid region rows {}..={} cols {}..={}",
                row_start, row_end, col_start, col_end
            )));
        }
        let pixels: Vec<usize> = (row_start..=row_end)
            .flat_map(|r| (col_start..=col_end).map(move |c| rowcol_to_pixel(r, c)))
            .collect();
        self.select_pixels(&pixels)
    }

    /// Load a global gain mode into every pixel, then overlay each group's
    /// own configuration word on its pixels.
    pub fn configure(&mut self, mode: GainMode, groups: Vec<PixelGroup>) -> Result<PixelConfigSummary> {
        if let Some(g) = groups
            .iter()
            .find(|g| g.pixels.iter().any(|&p| p >= TOTAL_PIXELS))
        {
            return Err(DaqError::InvalidArgument(format!(
                "group {} references a pixel outside the array",
                g.name
            )));
        }

        let (lsb, msb) = split_config_word(mode.config_word());
        {
            let mut dev = self.ctx.device();
            dev.enable_array_config(true)?;
            dev.config_reset(true)?;
            dev.settle(Duration::from_millis(1));
            dev.config_data_write(lsb, msb)?;
            dev.settle(Duration::from_millis(1));
            dev.pixel_sel_write_all(ROWS as u32, COLS as u32)?;

            for g in &groups {
                let (lsb, msb) = split_config_word(g.config_word);
                dev.config_data_write(lsb, msb)?;
                dev.settle(Duration::from_millis(1));
                dev.pixel_sel_write_multiple(&to_addresses(&g.pixels))?;
            }
        }

        let summary = PixelConfigSummary {
            gain_mode: mode,
            config_word: mode.config_word(),
            groups: groups.len(),
            group_pixels: groups.iter().map(|g| g.pixels.len()).sum(),
        };
        info!(
            "Pixel array configured as {} ({:#011x}) with {} groups over {} pixels",
            mode, summary.config_word, summary.groups, summary.group_pixels
        );
        self.gain_mode = mode;
        self.groups = groups;
        Ok(summary)
    }
}

fn parse_hex(field: &str) -> Option<u64> {
    let field = field.trim();
    let digits = field
        .strip_prefix("0x")
        .or_else(|| field.strip_prefix("0X"))
        .unwrap_or(field);
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a stimulation site list.
///
/// Each record is `site_codes,config_hex`, where the first field may hold
/// several comma-separated site codes when quoted. Every record with at least
/// one in-range site becomes its own group. `#` comments and short records
/// are skipped; malformed records are skipped with a warning.
pub fn load_stim_pixels_csv(content: &str) -> Vec<PixelGroup> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let mut groups = Vec::new();
    for (row_num, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                warn!("Skipping CSV row {}: {}", row_num, e);
                continue;
            }
        };
        if record.len() < 2 {
            continue;
        }

        let Some(word) = parse_hex(&record[1]) else {
            warn!("Skipping CSV row {}: bad config word {:?}", row_num, &record[1]);
            continue;
        };
        let pixels: Vec<usize> = record[0]
            .split(',')
            .filter_map(|code| code.trim().parse::<u32>().ok())
            .filter_map(parse_site_code)
            .map(|(r, c)| rowcol_to_pixel(r, c))
            .collect();
        if pixels.is_empty() {
            continue;
        }

        groups.push(PixelGroup {
            name: format!("csv_row_{}", row_num),
            pixels,
            config_word: word,
        });
    }
    info!("Loaded {} pixel groups from CSV", groups.len());
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_and_site_code_bijections() {
        for i in 0..TOTAL_PIXELS {
            let (r, c) = pixel_to_rowcol(i);
            assert_eq!(rowcol_to_pixel(r, c), i);
            assert_eq!(parse_site_code(site_code(r, c)), Some((r, c)));
        }
        assert_eq!(site_code(0, 0), 101);
        assert_eq!(site_code(63, 63), 6464);
        assert_eq!(parse_site_code(6500), None);
        assert_eq!(parse_site_code(100), None);
    }

    #[test]
    fn gain_modes_parse_by_label() {
        for m in GainMode::ALL {
            assert_eq!(m.label().parse::<GainMode>().unwrap(), m);
            assert!(m.config_word() < 1 << 38);
        }
        assert_eq!("buffer mode".parse::<GainMode>().unwrap(), GainMode::Buffer);
        assert!("GainX1000".parse::<GainMode>().is_err());
        assert_eq!(split_config_word(0x24_0001_7003), (0x24, 0x0001_7003));
    }

    #[test]
    fn csv_rows_become_groups() {
        let content = "# site,config\n\"0101,0102\",0x2420014343\n6464,2420014743\n9999,0x1\n0203\n0304,zz\n";
        let groups = load_stim_pixels_csv(content);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].pixels, vec![0, 1]);
        assert_eq!(groups[0].config_word, 0x24_2001_4343);
        assert_eq!(groups[1].pixels, vec![TOTAL_PIXELS - 1]);
        assert_eq!(groups[1].config_word, 0x24_2001_4743);
    }

    #[test]
    fn region_bounds_are_inclusive() {
        let ctx = DeviceContext::simulated(0);
        let mut pixels = PixelController::new(ctx);
        assert_eq!(pixels.select_region(0, 1, 10, 12).unwrap(), 6);
        assert!(pixels.selected().contains(&rowcol_to_pixel(1, 12)));
        assert!(pixels.select_region(0, 64, 0, 0).is_err());
        assert!(pixels.select_pixels(&[4096]).is_err());
    }
}
