// Whole-image report: every STFS container on the partition with its
// contents, plus decoded account records and GPD summaries
// A file that fails to decode becomes an anomaly and the walk moves on.

use serde::Serialize;
use x360_core::{Anomaly, BlockDevice, X360Error};
use x360_filesystems::detection::PREFIX_LEN;
use x360_filesystems::families::xtaf::XtafGeometry;
use x360_filesystems::{
    decrypt_account, detect_bytes, AccountInfo, ContainerMagic, ContentType, FileKind, FilesystemOps, StfsTree,
    Xdbf, XtafTree,
};

#[derive(Debug, Serialize)]
pub struct Report {
    pub geometry: XtafGeometry,
    pub files: Vec<FileReport>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Serialize)]
pub struct FileReport {
    pub path: String,
    pub kind: FileKind,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account: Option<AccountInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gpd: Option<GpdSummary>,
}

impl FileReport {
    fn new(path: &str, kind: FileKind, size: u64) -> Self {
        Self {
            path: path.to_string(),
            kind,
            size,
            container: None,
            account: None,
            gpd: None,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ContainerReport {
    pub magic: ContainerMagic,
    pub content_type: ContentType,
    pub title_id: u32,
    pub display_name: String,
    pub title_name: String,
    pub files: Vec<FileReport>,
}

#[derive(Debug, Serialize)]
pub struct GpdSummary {
    pub titles: usize,
    pub achievements: usize,
    pub settings: usize,
    pub gamerscore: i64,
}

impl From<&Xdbf> for GpdSummary {
    fn from(gpd: &Xdbf) -> Self {
        Self {
            titles: gpd.titles.len(),
            achievements: gpd.achievements.len(),
            settings: gpd.settings.len(),
            gamerscore: gpd.gamerscore(),
        }
    }
}

/// Walk the whole partition
pub fn build<D: BlockDevice>(tree: &XtafTree<D>) -> anyhow::Result<Report> {
    let mut files = Vec::new();
    let mut anomalies = Vec::new();

    for path in tree.walk("/")? {
        let entry = match tree.stat(&path) {
            Ok(entry) if !entry.is_directory => entry,
            Ok(_) => continue,
            Err(e) => {
                anomalies.push(Anomaly::from_error(path.as_str(), &e));
                continue;
            }
        };

        let file = describe(tree, &path, entry.size(), &mut anomalies).and_then(|mut file| {
            if file.kind == FileKind::Stfs {
                let stfs = StfsTree::open(tree.open_file(&path)?)?;
                file.container = Some(describe_container(&stfs, &path, &mut anomalies));
            }
            Ok(file)
        });
        match file {
            Ok(file) => files.push(file),
            Err(e) => {
                log::warn!("Skipping {}: {}", path, e);
                anomalies.push(Anomaly::from_error(path.as_str(), &e));
            }
        }
    }

    let mut all = tree.anomalies();
    all.extend(anomalies);
    Ok(Report {
        geometry: *tree.geometry(),
        files,
        anomalies: all,
    })
}

fn describe_container<D: BlockDevice>(stfs: &StfsTree<D>, container_path: &str, anomalies: &mut Vec<Anomaly>) -> ContainerReport {
    let header = stfs.header();
    let mut files = Vec::new();
    for path in stfs.paths() {
        let Some(entry) = stfs.get(&path) else {
            continue;
        };
        if entry.is_directory() {
            continue;
        }
        match describe(stfs, &path, entry.size(), anomalies) {
            Ok(file) => files.push(file),
            Err(e) => anomalies.push(Anomaly::from_error(format!("{}:{}", container_path, path), &e)),
        }
    }

    anomalies.extend(stfs.anomalies().into_iter().map(|mut anomaly| {
        anomaly.location = format!("{}:{}", container_path, anomaly.location);
        anomaly
    }));

    ContainerReport {
        magic: header.magic,
        content_type: header.content_kind(),
        title_id: header.title_id,
        display_name: header.display_name(),
        title_name: header.title_name(),
        files,
    }
}

/// Sniff one file and decode it when it is an account record or a GPD
fn describe(fs: &dyn FilesystemOps, path: &str, size: u64, anomalies: &mut Vec<Anomaly>) -> Result<FileReport, X360Error> {
    let prefix = fs.read(path, 0, PREFIX_LEN as u32)?;
    let kind = detect_bytes(&prefix, size);
    let mut report = FileReport::new(path, kind, size);

    match kind {
        FileKind::Account => {
            let data = fs.read(path, 0, size as u32)?;
            report.account = Some(decrypt_account(&data)?);
        }
        FileKind::Xdbf => {
            let data = fs.read(path, 0, size as u32)?;
            let gpd = Xdbf::parse(&data)?;
            anomalies.extend(gpd.anomalies.iter().cloned().map(|mut anomaly| {
                anomaly.location = format!("{}:{}", path, anomaly.location);
                anomaly
            }));
            report.gpd = Some(GpdSummary::from(&gpd));
        }
        _ => {}
    }
    Ok(report)
}

pub fn print(report: &Report) {
    let geo = &report.geometry;
    println!(
        "XTAF partition at {:#x}: {} clusters, root at {:#x}",
        geo.start, geo.fat_entries, geo.root_region_start
    );

    for file in &report.files {
        print_file(file, 0);
    }

    if !report.anomalies.is_empty() {
        println!("\n{} anomalies:", report.anomalies.len());
        for anomaly in &report.anomalies {
            println!("  {}", anomaly);
        }
    }
}

fn print_file(file: &FileReport, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{} [{}] {} bytes", indent, file.path, file.kind, file.size);

    if let Some(container) = &file.container {
        println!(
            "{}  {} {:?}, title {:08X} {:?}, \"{}\"",
            indent,
            container.magic.as_str(),
            container.content_type,
            container.title_id,
            container.title_name,
            container.display_name
        );
        for inner in &container.files {
            print_file(inner, depth + 2);
        }
    }
    if let Some(account) = &file.account {
        println!(
            "{}  Gamertag {} ({:?}{})",
            indent,
            account.gamertag,
            account.membership,
            account.xuid.as_ref().map(|x| format!(", XUID {}", x)).unwrap_or_default()
        );
    }
    if let Some(gpd) = &file.gpd {
        println!(
            "{}  {} titles, {} achievements, {} settings, {} gamerscore",
            indent, gpd.titles, gpd.achievements, gpd.settings, gpd.gamerscore
        );
    }
}
