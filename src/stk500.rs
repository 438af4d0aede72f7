/*! STK500v1 programmer.

Reflashes a node's application firmware over the same RS-485 line the bus
runs on, speaking the Atmel STK500 version 1 bootloader protocol. Every
transaction writes the command bytes terminated by `CRC_EOP` and expects
the reply bracketed by `STK_INSYNC` … `STK_OK`; a transaction that falls
out of sync is retried up to nine times before the session aborts.

The session must own the line: take an
[`ExclusiveSession`](crate::bus::ExclusiveSession) from the hub first, or
run against a freshly opened port with no engine on it.
*/
use std::path::Path;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use crate::{Error, Result};

pub(crate) const STK_OK: u8 = 0x10;
pub(crate) const STK_INSYNC: u8 = 0x14;
pub(crate) const CRC_EOP: u8 = 0x20;
const STK_GET_SYNC: u8 = 0x30;
const STK_GET_PARAMETER: u8 = 0x41;
const STK_ENTER_PROGMODE: u8 = 0x50;
const STK_LEAVE_PROGMODE: u8 = 0x51;
const STK_LOAD_ADDRESS: u8 = 0x55;
const STK_UNIVERSAL: u8 = 0x56;
const STK_PROG_PAGE: u8 = 0x64;
const STK_READ_PAGE: u8 = 0x74;
const STK_READ_SIGN: u8 = 0x75;
const STK_HARDWARE: u8 = 0x80;
const STK_SW_MAJOR: u8 = 0x81;
const STK_SW_MINOR: u8 = 0x82;
// Bootloader-specific parameters holding the node serial number.
const SN_MAJOR: u8 = 0x92;
const SN_MINOR: u8 = 0x93;
const FLASH_MEMORY: u8 = 0x46;

const SYNC: [u8; 2] = [STK_GET_SYNC, CRC_EOP];
const ENTER_PROG_MODE: [u8; 2] = [STK_ENTER_PROGMODE, CRC_EOP];
const EXIT_PROG_MODE: [u8; 2] = [STK_LEAVE_PROGMODE, CRC_EOP];
const GET_SIGNATURE: [u8; 2] = [STK_READ_SIGN, CRC_EOP];
const GET_SAFE_LFUSE: [u8; 6] = [STK_UNIVERSAL, 0x50, 0x00, 0x00, 0x00, CRC_EOP];
const GET_SAFE_HFUSE: [u8; 6] = [STK_UNIVERSAL, 0x58, 0x08, 0x00, 0x00, CRC_EOP];
const GET_SAFE_EFUSE: [u8; 6] = [STK_UNIVERSAL, 0x50, 0x08, 0x00, 0x00, CRC_EOP];

/// Flash page size, bytes.
pub const PAGE_SIZE: usize = 128;
// Load addresses are word-granular: one page is 64 words.
const WORDS_PER_PAGE: u16 = 64;
const SYNC_RETRY: usize = 9;
const READ_TIMEOUT: Duration = Duration::from_secs(2);

// Bit-banging allowance for the half-duplex line turnaround.
fn turnaround(written: usize) -> Duration {
    Duration::from_micros(written as u64 * 530 + 1000)
}

/// The data records of an Intel HEX file, concatenated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexFile {
    data: Vec<u8>,
}

impl HexFile {
    /// Read and parse a HEX file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    /// Parse HEX text: `:LLAAAATT<payload>CC` per line, stopping at the
    /// end-of-file record.
    pub fn parse(text: &str) -> Result<Self> {
        let mut data = Vec::new();
        for (n, raw) in text.lines().enumerate() {
            let line = raw.trim_end();
            if line.is_empty() {
                continue;
            }
            if !line.starts_with(':') || line.len() < 11 {
                return Err(Error::BadHex(format!("line {}: malformed record", n + 1)));
            }
            if &line[7..9] == "01" {
                break;
            }
            let payload = &line[9..line.len() - 2];
            if payload.len() % 2 != 0 {
                return Err(Error::BadHex(format!("line {}: odd digit count", n + 1)));
            }
            for i in (0..payload.len()).step_by(2) {
                data.push(
                    u8::from_str_radix(&payload[i..i + 2], 16)
                        .map_err(|_| Error::BadHex(format!("line {}: bad hex digits", n + 1)))?,
                );
            }
        }
        Ok(Self { data })
    }

    /// Total program size, bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the file carried no data records.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The program in flash-page chunks.
    pub fn pages(&self) -> std::slice::Chunks<'_, u8> {
        self.data.chunks(PAGE_SIZE)
    }
}

/// Hardware and bootloader identity, from [`Programmer::info`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// Hardware version.
    pub hardware: u8,
    /// Bootloader version, major.
    pub sw_major: u8,
    /// Bootloader version, minor.
    pub sw_minor: u8,
    /// Node serial number.
    pub serial: u16,
    /// MCU signature bytes.
    pub signature: [u8; 3],
    /// Fuse bytes: low, high, extended.
    pub fuses: (u8, u8, u8),
}

impl std::fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "hardware {:#04x}, bootloader {}.{}, serial {}, signature {:02x}-{:02x}-{:02x}, fuses E:{:#04x} H:{:#04x} L:{:#04x}",
            self.hardware,
            self.sw_major,
            self.sw_minor,
            self.serial,
            self.signature[0],
            self.signature[1],
            self.signature[2],
            self.fuses.2,
            self.fuses.1,
            self.fuses.0,
        )
    }
}

/// One programming session over a borrowed port.
pub struct Programmer<R, W> {
    rd: R,
    wr: W,
    retry: usize,
}

impl<R: AsyncRead + Unpin, W: AsyncWrite + Unpin> Programmer<R, W> {
    /// Wrap the two halves of an exclusively-held port.
    pub fn new(rd: R, wr: W) -> Self {
        Self {
            rd,
            wr,
            retry: SYNC_RETRY,
        }
    }

    async fn transaction(&mut self, codes: &[u8], reply_len: usize) -> Result<Vec<u8>> {
        for attempt in 0..=self.retry {
            debug!("Send {codes:02x?}");
            sleep(Duration::from_millis(10)).await;
            self.wr.write_all(codes).await?;
            self.wr.flush().await?;
            sleep(turnaround(codes.len())).await;
            let mut reply = vec![0u8; reply_len + 2];
            let in_sync = match timeout(READ_TIMEOUT, self.rd.read_exact(&mut reply)).await {
                Ok(Ok(_)) => {
                    debug!("Received {reply:02x?}");
                    reply.first() == Some(&STK_INSYNC) && reply.last() == Some(&STK_OK)
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => false,
            };
            if in_sync {
                reply.pop();
                reply.remove(0);
                return Ok(reply);
            }
            if attempt < self.retry {
                warn!("Retry {}", attempt + 1);
            }
        }
        error!("Not in sync");
        Err(Error::OutOfSync)
    }

    async fn parameter(&mut self, code: u8) -> Result<u8> {
        let r = self
            .transaction(&[STK_GET_PARAMETER, code, CRC_EOP], 1)
            .await?;
        Ok(r[0])
    }

    async fn load_address(&mut self, address: u16) -> Result<()> {
        debug!("Sending page address");
        let [low, high] = address.to_le_bytes();
        self.transaction(&[STK_LOAD_ADDRESS, low, high, CRC_EOP], 0)
            .await?;
        Ok(())
    }

    /// Get in sync with the bootloader.
    pub async fn sync(&mut self) -> Result<()> {
        for _ in 0..3 {
            debug!("Syncing");
            self.transaction(&SYNC, 0).await?;
        }
        Ok(())
    }

    /// Write the program to flash, page by page.
    pub async fn program(&mut self, hex: &HexFile) -> Result<()> {
        self.sync().await?;
        debug!("Entering programming mode");
        self.transaction(&ENTER_PROG_MODE, 0).await?;
        let mut address: u16 = 0;
        for page in hex.pages() {
            self.load_address(address).await?;
            info!(
                "Sending page {}:{} block size:{}",
                address >> 8,
                address & 0xff,
                page.len()
            );
            address += WORDS_PER_PAGE;
            let mut codes = Vec::with_capacity(page.len() + 5);
            codes.extend_from_slice(&[STK_PROG_PAGE, 0, page.len() as u8, FLASH_MEMORY]);
            codes.extend_from_slice(page);
            codes.push(CRC_EOP);
            self.transaction(&codes, 0).await?;
        }
        debug!("Leaving programming mode");
        self.transaction(&EXIT_PROG_MODE, 0).await?;
        info!("Program size {} bytes", hex.len());
        Ok(())
    }

    /// Read flash back page by page and compare against the HEX file.
    pub async fn verify(&mut self, hex: &HexFile) -> Result<()> {
        self.sync().await?;
        debug!("Entering programming mode");
        self.transaction(&ENTER_PROG_MODE, 0).await?;
        let mut address: u16 = 0;
        for (index, page) in hex.pages().enumerate() {
            self.load_address(address).await?;
            address += WORDS_PER_PAGE;
            info!("Reading program page {index}");
            let read = self
                .transaction(
                    &[STK_READ_PAGE, 0, PAGE_SIZE as u8, FLASH_MEMORY, CRC_EOP],
                    PAGE_SIZE,
                )
                .await?;
            if &read[..page.len()] != page {
                error!("Page {index} differs from hex file");
                self.transaction(&EXIT_PROG_MODE, 0).await?;
                return Err(Error::Verify(index as u16));
            }
        }
        debug!("Leaving programming mode");
        self.transaction(&EXIT_PROG_MODE, 0).await?;
        info!("Program check OK");
        Ok(())
    }

    /// Read hardware, bootloader, serial number, signature and fuses.
    pub async fn info(&mut self) -> Result<DeviceInfo> {
        self.sync().await?;
        let hardware = self.parameter(STK_HARDWARE).await?;
        let sw_major = self.parameter(STK_SW_MAJOR).await?;
        let sw_minor = self.parameter(STK_SW_MINOR).await?;
        let sn_major = self.parameter(SN_MAJOR).await?;
        let sn_minor = self.parameter(SN_MINOR).await?;
        debug!("Entering programming mode");
        self.transaction(&ENTER_PROG_MODE, 0).await?;
        let sig = self.transaction(&GET_SIGNATURE, 3).await?;
        let lfuse = self.transaction(&GET_SAFE_LFUSE, 1).await?[0];
        let hfuse = self.transaction(&GET_SAFE_HFUSE, 1).await?[0];
        let efuse = self.transaction(&GET_SAFE_EFUSE, 1).await?[0];
        debug!("Leaving programming mode");
        self.transaction(&EXIT_PROG_MODE, 0).await?;
        Ok(DeviceInfo {
            hardware,
            sw_major,
            sw_minor,
            serial: u16::from(sn_major) * 256 + u16::from(sn_minor),
            signature: [sig[0], sig[1], sig[2]],
            fuses: (lfuse, hfuse, efuse),
        })
    }
}
