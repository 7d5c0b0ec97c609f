use bitflags::bitflags;
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use std::{
    fs,
    io::{self, Read, Write},
    path::Path,
};

// Shell link (`.lnk`) files according to MS-SHLLINK:
// https://winprotocoldoc.z19.web.core.windows.net/MS-SHLLINK/%5bMS-SHLLINK%5d.pdf
//
// The target is stored as a LinkInfo local base path, which the shell
// resolves without needing an item id list.

const HEADER_SIZE: u32 = 0x4c;
const LINK_CLSID: [u8; 16] = [
    0x01, 0x14, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0xc0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46,
];
const LINK_INFO_HEADER_SIZE: u32 = 0x24;
const VOLUME_ID_SIZE: u32 = 0x11;
const DRIVE_FIXED: u32 = 3;

/// 100ns intervals between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH: i64 = 116444736000000000;

#[derive(Debug, Clone, Copy)]
enum ShowCommand {
    Normal = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellLink {
    pub target: String,
    pub working_dir: Option<String>,
    pub arguments: Option<String>,
    pub icon_location: Option<String>,
    pub icon_index: i32,
}

impl ShellLink {
    pub fn new(target: &Path) -> Self {
        Self {
            target: target.display().to_string(),
            working_dir: target
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .map(|dir| dir.display().to_string()),
            arguments: None,
            icon_location: None,
            icon_index: 0,
        }
    }

    pub fn icon(mut self, icon: &Path, index: i32) -> Self {
        self.icon_location = Some(icon.display().to_string());
        self.icon_index = index;
        self
    }

    /// Writes the link to `path`, replacing whatever is there.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let file_size = fs::metadata(&self.target)
            .map(|meta| meta.len().min(u32::MAX as u64) as u32)
            .unwrap_or(0);
        let mut buffer = Vec::new();
        self.write(&mut buffer, file_size, Utc::now())?;
        fs::write(path, buffer)
    }

    pub fn write(
        &self,
        writer: &mut impl Write,
        file_size: u32,
        time: DateTime<Utc>,
    ) -> io::Result<()> {
        let mut flags = LinkFlags::HAS_LINK_INFO | LinkFlags::IS_UNICODE;
        flags.set(LinkFlags::HAS_WORKING_DIR, self.working_dir.is_some());
        flags.set(LinkFlags::HAS_ARGUMENTS, self.arguments.is_some());
        flags.set(LinkFlags::HAS_ICON_LOCATION, self.icon_location.is_some());

        write_header(writer, flags, file_size, self.icon_index, time)?;
        write_link_info(writer, &self.target)?;

        for value in [&self.working_dir, &self.arguments, &self.icon_location]
            .into_iter()
            .flatten()
        {
            write_sized_utf16(writer, value)?;
        }

        // TerminalBlock, no extra data
        writer.write_u32::<LE>(0)?;
        Ok(())
    }

    /// Reads back the fields this writer produces. Links with an item id list
    /// or network targets are skipped over where possible.
    pub fn read(data: &mut impl Read) -> io::Result<Self> {
        if data.read_u32::<LE>()? != HEADER_SIZE {
            return Err(invalid("not a shell link"));
        }
        let mut clsid = [0u8; 16];
        data.read_exact(&mut clsid)?;
        if clsid != LINK_CLSID {
            return Err(invalid("unexpected link CLSID"));
        }
        let flags = LinkFlags::from_bits_retain(data.read_u32::<LE>()?);
        // FileAttributes, three timestamps, FileSize
        skip(data, 4 + 8 * 3 + 4)?;
        let icon_index = data.read_i32::<LE>()?;
        // ShowCommand, HotKey, three reserved fields
        skip(data, 4 + 2 + 2 + 4 + 4)?;

        if flags.contains(LinkFlags::HAS_LINK_TARGET_ID_LIST) {
            let size = data.read_u16::<LE>()?;
            skip(data, size as u64)?;
        }

        let mut target = String::new();
        if flags.contains(LinkFlags::HAS_LINK_INFO) {
            target = read_link_info(data)?;
        }

        let utf16 = flags.contains(LinkFlags::IS_UNICODE);
        let mut read_string = |present: bool| -> io::Result<Option<String>> {
            if present {
                read_sized_string(data, utf16).map(Some)
            } else {
                Ok(None)
            }
        };
        let _name = read_string(flags.contains(LinkFlags::HAS_NAME))?;
        let _relative_path = read_string(flags.contains(LinkFlags::HAS_RELATIVE_PATH))?;
        let working_dir = read_string(flags.contains(LinkFlags::HAS_WORKING_DIR))?;
        let arguments = read_string(flags.contains(LinkFlags::HAS_ARGUMENTS))?;
        let icon_location = read_string(flags.contains(LinkFlags::HAS_ICON_LOCATION))?;

        Ok(Self {
            target,
            working_dir,
            arguments,
            icon_location,
            icon_index,
        })
    }
}

fn write_header(
    writer: &mut impl Write,
    flags: LinkFlags,
    file_size: u32,
    icon_index: i32,
    time: DateTime<Utc>,
) -> io::Result<()> {
    writer.write_u32::<LE>(HEADER_SIZE)?;
    writer.write_all(&LINK_CLSID)?;
    writer.write_u32::<LE>(flags.bits())?;
    writer.write_u32::<LE>(FileAttributeFlags::FILE_ATTRIBUTE_ARCHIVE.bits())?;

    let filetime = to_filetime(time);
    // CreationTime, AccessTime, WriteTime
    for _ in 0..3 {
        writer.write_u64::<LE>(filetime)?;
    }

    writer.write_u32::<LE>(file_size)?;
    writer.write_i32::<LE>(icon_index)?;
    writer.write_u32::<LE>(ShowCommand::Normal as u32)?;
    // HotKey
    writer.write_u16::<LE>(0)?;
    // Reserved 1-3
    writer.write_u16::<LE>(0)?;
    writer.write_u32::<LE>(0)?;
    writer.write_u32::<LE>(0)?;

    Ok(())
}

fn to_filetime(time: DateTime<Utc>) -> u64 {
    let intervals = time.timestamp() * 10_000_000 + time.timestamp_subsec_nanos() as i64 / 100;
    (intervals + WINDOWS_EPOCH).max(0) as u64
}

fn write_link_info(writer: &mut impl Write, target: &str) -> io::Result<()> {
    // Non-unicode copy for old readers, ASCII only.
    let ansi: Vec<u8> = target
        .chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect();
    let unicode: Vec<u16> = target.encode_utf16().collect();

    let volume_id_offset = LINK_INFO_HEADER_SIZE;
    let local_base_path_offset = volume_id_offset + VOLUME_ID_SIZE;
    let common_path_suffix_offset = local_base_path_offset + ansi.len() as u32 + 1;
    let local_base_path_unicode_offset = common_path_suffix_offset + 1;
    let common_path_suffix_unicode_offset =
        local_base_path_unicode_offset + (unicode.len() as u32 + 1) * 2;
    let link_info_size = common_path_suffix_unicode_offset + 2;

    writer.write_u32::<LE>(link_info_size)?;
    writer.write_u32::<LE>(LINK_INFO_HEADER_SIZE)?;
    writer.write_u32::<LE>(LinkInfoFlags::VOLUME_ID_AND_LOCAL_BASE_PATH.bits())?;
    writer.write_u32::<LE>(volume_id_offset)?;
    writer.write_u32::<LE>(local_base_path_offset)?;
    // CommonNetworkRelativeLinkOffset
    writer.write_u32::<LE>(0)?;
    writer.write_u32::<LE>(common_path_suffix_offset)?;
    writer.write_u32::<LE>(local_base_path_unicode_offset)?;
    writer.write_u32::<LE>(common_path_suffix_unicode_offset)?;

    // VolumeID with an empty label
    writer.write_u32::<LE>(VOLUME_ID_SIZE)?;
    writer.write_u32::<LE>(DRIVE_FIXED)?;
    writer.write_u32::<LE>(0)?;
    writer.write_u32::<LE>(0x10)?;
    writer.write_u8(0)?;

    writer.write_all(&ansi)?;
    writer.write_u8(0)?;
    // CommonPathSuffix
    writer.write_u8(0)?;
    for unit in unicode {
        writer.write_u16::<LE>(unit)?;
    }
    writer.write_u16::<LE>(0)?;
    writer.write_u16::<LE>(0)?;

    Ok(())
}

fn read_link_info(data: &mut impl Read) -> io::Result<String> {
    let size = data.read_u32::<LE>()?;
    if size < 0x1c {
        return Err(invalid("link info too small"));
    }
    let mut block = vec![0u8; size as usize - 4];
    data.read_exact(&mut block)?;
    let mut header = &block[..];
    let header_size = header.read_u32::<LE>()?;
    let flags = LinkInfoFlags::from_bits_retain(header.read_u32::<LE>()?);
    let _volume_id_offset = header.read_u32::<LE>()?;
    let local_base_path_offset = header.read_u32::<LE>()?;
    let _network_offset = header.read_u32::<LE>()?;
    let _suffix_offset = header.read_u32::<LE>()?;

    if !flags.contains(LinkInfoFlags::VOLUME_ID_AND_LOCAL_BASE_PATH) {
        return Ok(String::new());
    }

    // Offsets count from the start of the structure, `block` starts after the size field.
    let at = |offset: u32| -> io::Result<&[u8]> {
        (offset as usize)
            .checked_sub(4)
            .and_then(|start| block.get(start..))
            .ok_or_else(|| invalid("link info offset out of range"))
    };

    if header_size >= LINK_INFO_HEADER_SIZE {
        let unicode_offset = header.read_u32::<LE>()?;
        let mut units = Vec::new();
        let mut raw = at(unicode_offset)?;
        loop {
            let unit = raw.read_u16::<LE>()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units).map_err(|_| invalid("invalid UTF-16 in link target"))
    } else {
        let raw = at(local_base_path_offset)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

fn write_sized_utf16(writer: &mut impl Write, value: &str) -> io::Result<()> {
    let units: Vec<u16> = value.encode_utf16().collect();
    let count = u16::try_from(units.len()).map_err(|_| invalid("string too long for a link"))?;
    writer.write_u16::<LE>(count)?;
    for unit in units {
        writer.write_u16::<LE>(unit)?;
    }
    Ok(())
}

fn read_sized_string(data: &mut impl Read, utf16: bool) -> io::Result<String> {
    let count = data.read_u16::<LE>()? as usize;
    if utf16 {
        let mut units = Vec::with_capacity(count);
        for _ in 0..count {
            units.push(data.read_u16::<LE>()?);
        }
        String::from_utf16(&units).map_err(|_| invalid("invalid UTF-16 string"))
    } else {
        let mut raw = vec![0u8; count];
        data.read_exact(&mut raw)?;
        Ok(String::from_utf8_lossy(&raw).into_owned())
    }
}

fn skip(data: &mut impl Read, count: u64) -> io::Result<()> {
    let skipped = io::copy(&mut data.take(count), &mut io::sink())?;
    if skipped != count {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }
    Ok(())
}

fn invalid(message: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

bitflags! {
    /// Which structures follow the ShellLinkHeader (section 2.1.1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct LinkFlags: u32 {
        const HAS_LINK_TARGET_ID_LIST = 0x0000_0001;
        const HAS_LINK_INFO           = 0x0000_0002;
        const HAS_NAME                = 0x0000_0004;
        const HAS_RELATIVE_PATH       = 0x0000_0008;
        const HAS_WORKING_DIR         = 0x0000_0010;
        const HAS_ARGUMENTS           = 0x0000_0020;
        const HAS_ICON_LOCATION       = 0x0000_0040;
        /// StringData is UTF-16.
        const IS_UNICODE              = 0x0000_0080;
    }
}

bitflags! {
    /// Attributes of the link target (section 2.1.2). Only the ones we set.
    #[derive(Debug, Clone, Copy)]
    struct FileAttributeFlags: u32 {
        const FILE_ATTRIBUTE_ARCHIVE = 0x0000_0020;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy)]
    struct LinkInfoFlags: u32 {
        const VOLUME_ID_AND_LOCAL_BASE_PATH                = 0x0000_0001;
        const COMMON_NETWORK_RELATIVE_LINK_AND_PATH_SUFFIX = 0x0000_0002;
    }
}
