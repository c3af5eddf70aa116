//! Flash-backed settings storage.
//!
//! The settings text lives as one framed record (see
//! `wakeon_core::settings`) in the last sector of the first writable data
//! partition, preferring the undefined data subtype and falling back to
//! NVS space.

use embedded_storage::{ReadStorage, Storage};
use esp_bootloader_esp_idf::partitions::{
    DataPartitionSubType, PARTITION_TABLE_MAX_LEN, PartitionType, read_partition_table,
};
use esp_rom_sys::rom::spiflash::{
    ESP_ROM_SPIFLASH_RESULT_OK, esp_rom_spiflash_erase_sector, esp_rom_spiflash_read,
    esp_rom_spiflash_unlock, esp_rom_spiflash_write,
};
use log::debug;
use wakeon_core::settings::{
    DeviceSettings, RECORD_MAX_LEN, RecordError, SettingsStore, decode_record, encode_record,
};

const FLASH_SECTOR_SIZE: u32 = 4096;
const DEFAULT_FLASH_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlashConfigError {
    PartitionTable,
    ConfigPartitionMissing,
    PartitionTooSmall,
    FlashOpFailed(i32),
    Corrupted,
    Oversized,
    Unsupported,
}

impl From<RecordError> for FlashConfigError {
    fn from(err: RecordError) -> Self {
        match err {
            RecordError::Corrupted => Self::Corrupted,
            RecordError::Oversized => Self::Oversized,
        }
    }
}

#[derive(Debug)]
struct RawFlash;

impl RawFlash {
    fn new() -> Result<Self, FlashConfigError> {
        let rc = unsafe { esp_rom_spiflash_unlock() };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(Self)
    }

    fn read_word(&mut self, addr: u32) -> Result<u32, FlashConfigError> {
        let mut word = 0u32;
        let rc = unsafe { esp_rom_spiflash_read(addr, &mut word as *mut u32 as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(word)
    }

    fn write_word(&mut self, addr: u32, word: u32) -> Result<(), FlashConfigError> {
        let rc = unsafe { esp_rom_spiflash_write(addr, &word as *const u32, 4) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(())
    }

    /// Read `out.len()` bytes starting at any byte address. The ROM read
    /// works in words; the overlap of each word with the requested window
    /// is copied out.
    fn read_bytes(&mut self, addr: u32, out: &mut [u8]) -> Result<(), FlashConfigError> {
        if out.is_empty() {
            return Ok(());
        }

        let mut word_addr = addr & !0b11;
        let mut copied = 0usize;
        while copied < out.len() {
            let bytes = self.read_word(word_addr)?.to_le_bytes();
            for (i, b) in bytes.iter().enumerate() {
                let flash_addr = word_addr + i as u32;
                if flash_addr < addr {
                    continue;
                }
                let idx = (flash_addr - addr) as usize;
                if idx >= out.len() {
                    break;
                }
                out[idx] = *b;
                copied = idx + 1;
            }
            word_addr += 4;
        }
        Ok(())
    }

    fn erase_sector(&mut self, sector_addr: u32) -> Result<(), FlashConfigError> {
        if !sector_addr.is_multiple_of(FLASH_SECTOR_SIZE) {
            return Err(FlashConfigError::Unsupported);
        }

        let rc = unsafe { esp_rom_spiflash_erase_sector(sector_addr / FLASH_SECTOR_SIZE) };
        if rc != ESP_ROM_SPIFLASH_RESULT_OK {
            return Err(FlashConfigError::FlashOpFailed(rc));
        }
        Ok(())
    }

    /// Write into a freshly erased, sector-aligned region. Trailing bytes
    /// of the last word stay erased (0xFF).
    fn write_erased(&mut self, addr: u32, data: &[u8]) -> Result<(), FlashConfigError> {
        if !addr.is_multiple_of(4) {
            return Err(FlashConfigError::Unsupported);
        }

        for (i, chunk) in data.chunks(4).enumerate() {
            let mut bytes = [0xFFu8; 4];
            bytes[..chunk.len()].copy_from_slice(chunk);
            self.write_word(addr + (i as u32) * 4, u32::from_le_bytes(bytes))?;
        }
        Ok(())
    }
}

impl ReadStorage for RawFlash {
    type Error = FlashConfigError;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.read_bytes(offset, bytes)
    }

    fn capacity(&self) -> usize {
        DEFAULT_FLASH_CAPACITY_BYTES
    }
}

impl Storage for RawFlash {
    fn write(&mut self, _offset: u32, _bytes: &[u8]) -> Result<(), Self::Error> {
        Err(FlashConfigError::Unsupported)
    }
}

#[derive(Debug)]
pub struct FlashConfigStore {
    flash: RawFlash,
    config_sector_addr: u32,
}

impl FlashConfigStore {
    pub fn new() -> Result<Self, FlashConfigError> {
        let mut flash = RawFlash::new()?;

        let mut table_buf = [0u8; PARTITION_TABLE_MAX_LEN];
        let table = read_partition_table(&mut flash, &mut table_buf)
            .map_err(|_| FlashConfigError::PartitionTable)?;

        let mut undefined_data: Option<(u32, u32)> = None;
        let mut fallback_nvs: Option<(u32, u32)> = None;
        for entry in table.iter() {
            if entry.is_read_only() || entry.len() < FLASH_SECTOR_SIZE {
                continue;
            }
            match entry.partition_type() {
                PartitionType::Data(DataPartitionSubType::Undefined) => {
                    undefined_data = Some((entry.offset(), entry.len()));
                    break;
                }
                PartitionType::Data(DataPartitionSubType::Nvs) => {
                    if fallback_nvs.is_none() {
                        fallback_nvs = Some((entry.offset(), entry.len()));
                    }
                }
                _ => {}
            }
        }

        let (offset, len) = undefined_data
            .or(fallback_nvs)
            .ok_or(FlashConfigError::ConfigPartitionMissing)?;
        if len < FLASH_SECTOR_SIZE {
            return Err(FlashConfigError::PartitionTooSmall);
        }

        Ok(Self {
            flash,
            config_sector_addr: offset + len - FLASH_SECTOR_SIZE,
        })
    }
}

impl SettingsStore for FlashConfigStore {
    type Error = FlashConfigError;

    fn load(&mut self) -> Result<Option<DeviceSettings>, Self::Error> {
        let mut buf = [0u8; RECORD_MAX_LEN];
        self.flash.read_bytes(self.config_sector_addr, &mut buf)?;

        match decode_record(&buf) {
            Ok(Some(text)) => {
                debug!("flash: settings record read from {:#x}", self.config_sector_addr);
                Ok(Some(DeviceSettings::decode(text)))
            }
            Ok(None) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn save(&mut self, settings: &DeviceSettings) -> Result<(), Self::Error> {
        let text = settings.encode().map_err(|_| FlashConfigError::Oversized)?;
        let mut buf = [0xFFu8; RECORD_MAX_LEN];
        let written = encode_record(&text, &mut buf)?;

        self.flash.erase_sector(self.config_sector_addr)?;
        self.flash.write_erased(self.config_sector_addr, &buf[..written])?;
        debug!(
            "flash: settings record written to {:#x} ({} bytes)",
            self.config_sector_addr, written
        );
        Ok(())
    }
}
