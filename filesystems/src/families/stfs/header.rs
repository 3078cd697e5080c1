// STFS container header
// Everything up to 0x971A is metadata at fixed offsets. Only the magic, the
// entry id and the volume descriptor drive traversal; the rest is carried
// through for reports.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use log::debug;
use serde::{Serialize, Serializer};
use x360_core::{BlockDevice, Result, X360Error};

use crate::strings::utf16_be;

/// Bytes of header read at open
pub const HEADER_SIZE: usize = 0x971A;

const THUMBNAIL_MAX: usize = 0x4000;

fn as_hex<S: Serializer>(bytes: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
}

/// Which of the three container flavours this is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContainerMagic {
    /// Console-signed, `CON `
    Con,
    /// Microsoft-signed for non-Live distribution, `PIRS`
    Pirs,
    /// Microsoft-signed for Live, `LIVE`
    Live,
}

impl ContainerMagic {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match bytes.get(..4)? {
            b"CON " => Some(Self::Con),
            b"PIRS" => Some(Self::Pirs),
            b"LIVE" => Some(Self::Live),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Con => "CON ",
            Self::Pirs => "PIRS",
            Self::Live => "LIVE",
        }
    }
}

/// Well-known `content_type` values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ContentType {
    SavedGame,
    MarketplaceContent,
    Publisher,
    Xbox360Title,
    IptvPauseBuffer,
    InstalledGame,
    XboxOriginalGame,
    GameOnDemand,
    AvatarItem,
    Profile,
    GamerPicture,
    Theme,
    CacheFile,
    StorageDownload,
    XboxSavedGame,
    XboxDownload,
    GameDemo,
    Video,
    GameTitle,
    Installer,
    GameTrailer,
    ArcadeTitle,
    Xna,
    LicenseStore,
    Movie,
    Tv,
    MusicVideo,
    GameVideo,
    PodcastVideo,
    ViralVideo,
    CommunityGame,
    Unknown(u32),
}

impl From<u32> for ContentType {
    fn from(value: u32) -> Self {
        match value {
            0x0000_0001 => Self::SavedGame,
            0x0000_0002 => Self::MarketplaceContent,
            0x0000_0003 => Self::Publisher,
            0x0000_1000 => Self::Xbox360Title,
            0x0000_2000 => Self::IptvPauseBuffer,
            0x0000_4000 => Self::InstalledGame,
            0x0000_5000 => Self::XboxOriginalGame,
            0x0000_7000 => Self::GameOnDemand,
            0x0000_9000 => Self::AvatarItem,
            0x0001_0000 => Self::Profile,
            0x0002_0000 => Self::GamerPicture,
            0x0003_0000 => Self::Theme,
            0x0004_0000 => Self::CacheFile,
            0x0005_0000 => Self::StorageDownload,
            0x0006_0000 => Self::XboxSavedGame,
            0x0007_0000 => Self::XboxDownload,
            0x0008_0000 => Self::GameDemo,
            0x0009_0000 => Self::Video,
            0x000A_0000 => Self::GameTitle,
            0x000B_0000 => Self::Installer,
            0x000C_0000 => Self::GameTrailer,
            0x000D_0000 => Self::ArcadeTitle,
            0x000E_0000 => Self::Xna,
            0x000F_0000 => Self::LicenseStore,
            0x0010_0000 => Self::Movie,
            0x0020_0000 => Self::Tv,
            0x0030_0000 => Self::MusicVideo,
            0x0040_0000 => Self::GameVideo,
            0x0050_0000 => Self::PodcastVideo,
            0x0060_0000 => Self::ViralVideo,
            0x0200_0000 => Self::CommunityGame,
            other => Self::Unknown(other),
        }
    }
}

/// Console certificate carried by `CON ` containers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleCertificate {
    #[serde(serialize_with = "as_hex")]
    pub console_id: Vec<u8>,
    #[serde(serialize_with = "as_hex")]
    pub part_number: Vec<u8>,
    /// 1 devkit, 2 retail
    pub console_type: u8,
    #[serde(serialize_with = "as_hex")]
    pub date: Vec<u8>,
    /// Exponent, modulus, certificate signature and header signature
    #[serde(skip)]
    pub blob: Vec<u8>,
}

/// The signing data at the top of the header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HeaderSignature {
    Console(ConsoleCertificate),
    /// Opaque RSA signature of `PIRS`/`LIVE` packages
    Remote {
        #[serde(skip)]
        blob: Vec<u8>,
    },
}

/// Where the file table is and how many blocks are in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeDescriptor {
    pub size: u8,
    pub block_separation: u8,
    pub filetable_blockcount: u16,
    pub filetable_blocknumber: u32,
    #[serde(serialize_with = "as_hex")]
    pub top_hash: Vec<u8>,
    pub allocated_count: u32,
    pub unallocated_count: u32,
}

/// Episode metadata present when `metadata_version == 2`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetadataV2 {
    #[serde(serialize_with = "as_hex")]
    pub series_id: Vec<u8>,
    #[serde(serialize_with = "as_hex")]
    pub season_id: Vec<u8>,
    pub season_number: u16,
    pub episode_number: u16,
    #[serde(skip)]
    pub additional_display_names: Vec<u8>,
    #[serde(skip)]
    pub additional_display_descriptions: Vec<u8>,
}

/// Parsed container header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerHeader {
    pub magic: ContainerMagic,
    pub signature: HeaderSignature,
    #[serde(skip)]
    pub license_entries: Vec<u8>,
    /// SHA1 of the header
    #[serde(serialize_with = "as_hex")]
    pub content_id: Vec<u8>,
    pub entry_id: u32,
    pub content_type: u32,
    pub metadata_version: u32,
    pub content_size: u64,
    pub media_id: u32,
    pub version: u32,
    pub base_version: u32,
    pub title_id: u32,
    pub platform: u8,
    pub executable_type: u8,
    pub disc_number: u8,
    pub disc_in_set: u8,
    pub save_game_id: u32,
    #[serde(serialize_with = "as_hex")]
    pub console_id: Vec<u8>,
    #[serde(serialize_with = "as_hex")]
    pub profile_id: Vec<u8>,
    pub volume: VolumeDescriptor,
    pub datafile_count: u32,
    pub datafile_size: u64,
    #[serde(serialize_with = "as_hex")]
    pub device_id: Vec<u8>,
    /// Display names for every locale, 0x80 bytes each
    #[serde(skip)]
    pub display_name_blob: Vec<u8>,
    #[serde(skip)]
    pub description_blob: Vec<u8>,
    #[serde(skip)]
    pub publisher_blob: Vec<u8>,
    #[serde(skip)]
    pub title_name_blob: Vec<u8>,
    pub transfer_flags: u8,
    #[serde(skip)]
    pub thumbnail: Vec<u8>,
    #[serde(skip)]
    pub title_image: Vec<u8>,
    pub metadata_v2: Option<MetadataV2>,
}

impl ContainerHeader {
    /// Parse the header from the start of a container
    pub fn parse(data: &[u8]) -> Result<Self> {
        let magic = ContainerMagic::from_bytes(data).ok_or_else(|| {
            X360Error::FormatMismatch(format!(
                "not an STFS container (magic {})",
                hex::encode(&data[..data.len().min(4)])
            ))
        })?;
        X360Error::check_len("STFS header", data, HEADER_SIZE)?;

        let signature = match magic {
            ContainerMagic::Con => HeaderSignature::Console(ConsoleCertificate {
                console_id: data[0x6..0xB].to_vec(),
                part_number: data[0xB..0x14].to_vec(),
                console_type: data[0x1F],
                date: data[0x20..0x28].to_vec(),
                blob: data[0x28..0x22C].to_vec(),
            }),
            ContainerMagic::Pirs | ContainerMagic::Live => HeaderSignature::Remote {
                blob: data[0x4..0x104].to_vec(),
            },
        };

        let metadata_version = BigEndian::read_u32(&data[0x348..]);
        let thumbnail_size = (BigEndian::read_u32(&data[0x1712..]) as usize).min(THUMBNAIL_MAX);
        let title_image_size = (BigEndian::read_u32(&data[0x1716..]) as usize).min(THUMBNAIL_MAX);

        let metadata_v2 = (metadata_version == 2).then(|| MetadataV2 {
            series_id: data[0x3B1..0x3C1].to_vec(),
            season_id: data[0x3C1..0x3D1].to_vec(),
            season_number: BigEndian::read_u16(&data[0x3D1..]),
            episode_number: BigEndian::read_u16(&data[0x3D3..]),
            additional_display_names: data[0x541A..0x571A].to_vec(),
            additional_display_descriptions: data[0x941A..0x971A].to_vec(),
        });

        let header = Self {
            magic,
            signature,
            license_entries: data[0x22C..0x32C].to_vec(),
            content_id: data[0x32C..0x340].to_vec(),
            entry_id: BigEndian::read_u32(&data[0x340..]),
            content_type: BigEndian::read_u32(&data[0x344..]),
            metadata_version,
            content_size: BigEndian::read_u64(&data[0x34C..]),
            media_id: BigEndian::read_u32(&data[0x354..]),
            version: BigEndian::read_u32(&data[0x358..]),
            base_version: BigEndian::read_u32(&data[0x35C..]),
            title_id: BigEndian::read_u32(&data[0x360..]),
            platform: data[0x364],
            executable_type: data[0x365],
            disc_number: data[0x366],
            disc_in_set: data[0x367],
            save_game_id: BigEndian::read_u32(&data[0x368..]),
            console_id: data[0x36C..0x371].to_vec(),
            profile_id: data[0x371..0x379].to_vec(),
            volume: VolumeDescriptor {
                size: data[0x379],
                block_separation: data[0x37B],
                filetable_blockcount: LittleEndian::read_u16(&data[0x37C..]),
                filetable_blocknumber: LittleEndian::read_u24(&data[0x37E..]),
                top_hash: data[0x381..0x395].to_vec(),
                allocated_count: BigEndian::read_u32(&data[0x395..]),
                unallocated_count: BigEndian::read_u32(&data[0x399..]),
            },
            datafile_count: BigEndian::read_u32(&data[0x39D..]),
            datafile_size: BigEndian::read_u64(&data[0x3A1..]),
            device_id: data[0x3FD..0x411].to_vec(),
            display_name_blob: data[0x411..0xD11].to_vec(),
            description_blob: data[0xD11..0x1611].to_vec(),
            publisher_blob: data[0x1611..0x1691].to_vec(),
            title_name_blob: data[0x1691..0x1711].to_vec(),
            transfer_flags: data[0x1711],
            thumbnail: data[0x171A..0x171A + thumbnail_size].to_vec(),
            title_image: data[0x571A..0x571A + title_image_size].to_vec(),
            metadata_v2,
        };

        debug!(
            "STFS header: {} entry_id={:#x} content_type={:#x} filetable={}+{} allocated={}",
            header.magic.as_str(),
            header.entry_id,
            header.content_type,
            header.volume.filetable_blocknumber,
            header.volume.filetable_blockcount,
            header.volume.allocated_count
        );
        Ok(header)
    }

    /// Read and parse the header of the container on `device`
    pub fn read_from<D: BlockDevice + ?Sized>(device: &D) -> Result<Self> {
        let data = device.read_at(0, HEADER_SIZE as u32)?;
        Self::parse(&data)
    }

    /// 0 when hash tables are one block wide, 1 when they come in pairs
    pub fn table_size_shift(&self) -> u32 {
        table_size_shift(self.entry_id)
    }

    pub fn content_kind(&self) -> ContentType {
        ContentType::from(self.content_type)
    }

    /// Display name in the first locale
    pub fn display_name(&self) -> String {
        utf16_be(&self.display_name_blob[..0x80])
    }

    /// Description in the first locale
    pub fn description(&self) -> String {
        utf16_be(&self.description_blob[..0x80])
    }

    pub fn publisher(&self) -> String {
        utf16_be(&self.publisher_blob)
    }

    pub fn title_name(&self) -> String {
        utf16_be(&self.title_name_blob)
    }
}

/// Hash-table width selector derived from the header's entry id
pub fn table_size_shift(entry_id: u32) -> u32 {
    if ((entry_id.wrapping_add(0xFFF) & 0xF000) >> 12) == 0xB {
        0
    } else {
        1
    }
}
