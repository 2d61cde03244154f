//! 랭킹 데이터 - 캐릭터 클래스/국가 조회 테이블 및 랭킹 HTML 파서
//!
//! 클래스와 국가는 아이콘 문자열, 약어, 포르투갈어/영어 이름 등 여러 키로
//! 조회됩니다. 역방향 인덱스는 최초 조회 시 한 번만 구성합니다.

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};

// ============================================================================
// CharacterClass
// ============================================================================

/// 캐릭터 클래스
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CharacterClass {
    Warrior,
    Blader,
    Wizard,
    ForceArcher,
    ForceShielder,
    ForceBlader,
    Gladiator,
    ForceGunner,
    DarkMage,
}

impl CharacterClass {
    /// 전체 클래스 (사이트 classId 순서)
    pub const ALL: [CharacterClass; 9] = [
        CharacterClass::Warrior,
        CharacterClass::Blader,
        CharacterClass::Wizard,
        CharacterClass::ForceArcher,
        CharacterClass::ForceShielder,
        CharacterClass::ForceBlader,
        CharacterClass::Gladiator,
        CharacterClass::ForceGunner,
        CharacterClass::DarkMage,
    ];

    /// 사이트 classId
    pub fn id(self) -> u8 {
        match self {
            CharacterClass::Warrior => 1,
            CharacterClass::Blader => 2,
            CharacterClass::Wizard => 3,
            CharacterClass::ForceArcher => 4,
            CharacterClass::ForceShielder => 5,
            CharacterClass::ForceBlader => 6,
            CharacterClass::Gladiator => 7,
            CharacterClass::ForceGunner => 8,
            CharacterClass::DarkMage => 9,
        }
    }

    /// 포르투갈어 약어 (디렉토리 이름으로도 사용)
    pub fn abbr(self) -> &'static str {
        match self {
            CharacterClass::Warrior => "GU",
            CharacterClass::Blader => "DU",
            CharacterClass::Wizard => "MA",
            CharacterClass::ForceArcher => "AA",
            CharacterClass::ForceShielder => "GA",
            CharacterClass::ForceBlader => "EA",
            CharacterClass::Gladiator => "GL",
            CharacterClass::ForceGunner => "AT",
            CharacterClass::DarkMage => "MN",
        }
    }

    pub fn name_pt(self) -> &'static str {
        match self {
            CharacterClass::Warrior => "Guerreiro",
            CharacterClass::Blader => "Duelista",
            CharacterClass::Wizard => "Mago",
            CharacterClass::ForceArcher => "Arqueiro Arcano",
            CharacterClass::ForceShielder => "Guardião Arcano",
            CharacterClass::ForceBlader => "Espadachim Arcano",
            CharacterClass::Gladiator => "Gladiador",
            CharacterClass::ForceGunner => "Atirador",
            CharacterClass::DarkMage => "Mago Negro",
        }
    }

    pub fn name_en(self) -> &'static str {
        match self {
            CharacterClass::Warrior => "Warrior",
            CharacterClass::Blader => "Blader",
            CharacterClass::Wizard => "Wizard",
            CharacterClass::ForceArcher => "Force Archer",
            CharacterClass::ForceShielder => "Force Shielder",
            CharacterClass::ForceBlader => "Force Blader",
            CharacterClass::Gladiator => "Gladiator",
            CharacterClass::ForceGunner => "Force Gunner",
            CharacterClass::DarkMage => "Dark Mage",
        }
    }

    /// 랭킹 아이콘 코드 (`icon-<code>.png`)
    pub fn icon(self) -> &'static str {
        match self {
            CharacterClass::Warrior => "wa",
            CharacterClass::Blader => "bl",
            CharacterClass::Wizard => "wz",
            CharacterClass::ForceArcher => "fa",
            CharacterClass::ForceShielder => "fs",
            CharacterClass::ForceBlader => "fb",
            CharacterClass::Gladiator => "gl",
            CharacterClass::ForceGunner => "fg",
            CharacterClass::DarkMage => "dm",
        }
    }

    /// 임의의 키로 클래스 조회
    ///
    /// id, 약어, 아이콘 코드, `icon-xx`, `Icon XX`(alt), 포르투갈어/영어 이름을
    /// 대소문자 구분 없이 받습니다.
    pub fn lookup(key: &str) -> Option<Self> {
        static INDEX: OnceLock<HashMap<String, CharacterClass>> = OnceLock::new();
        let index = INDEX.get_or_init(|| {
            let mut map = HashMap::new();
            for class in Self::ALL {
                map.insert(class.id().to_string(), class);
                map.insert(class.abbr().to_lowercase(), class);
                map.insert(class.icon().to_string(), class);
                map.insert(format!("icon-{}", class.icon()), class);
                map.insert(format!("icon {}", class.icon()), class);
                map.insert(class.name_pt().to_lowercase(), class);
                map.insert(class.name_en().to_lowercase(), class);
            }
            map
        });
        index.get(key.trim().to_lowercase().as_str()).copied()
    }

    /// 아이콘 이미지 경로(`.../ranking/icon-fb.png 1x`)에서 클래스 추출
    pub fn from_icon_src(src: &str) -> Option<Self> {
        static ICON_RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = ICON_RE
            .get_or_init(|| Regex::new(r"icon-([a-z]{2})\.").ok())
            .as_ref()?;
        re.captures_iter(&src.to_lowercase())
            .find_map(|caps| Self::lookup(&caps[1]))
    }
}

// ============================================================================
// Nation
// ============================================================================

/// 국가
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Nation {
    Procyon,
    Capella,
}

impl Nation {
    pub const ALL: [Nation; 2] = [Nation::Procyon, Nation::Capella];

    pub fn name_en(self) -> &'static str {
        match self {
            Nation::Procyon => "Procyon",
            Nation::Capella => "Capella",
        }
    }

    pub fn name_pt(self) -> &'static str {
        match self {
            Nation::Procyon => "Procion",
            Nation::Capella => "Capella",
        }
    }

    fn icon(self) -> &'static str {
        match self {
            Nation::Procyon => "icon-procyon",
            Nation::Capella => "icon-capella",
        }
    }

    /// 이름/아이콘 키로 국가 조회
    pub fn lookup(key: &str) -> Option<Self> {
        static INDEX: OnceLock<HashMap<String, Nation>> = OnceLock::new();
        let index = INDEX.get_or_init(|| {
            let mut map = HashMap::new();
            for nation in Self::ALL {
                map.insert(nation.icon().to_string(), nation);
                map.insert(nation.name_en().to_lowercase(), nation);
                map.insert(nation.name_pt().to_lowercase(), nation);
            }
            map
        });
        index.get(key.trim().to_lowercase().as_str()).copied()
    }

    /// 아이콘 경로 또는 자유 텍스트에서 국가 추출
    pub fn detect(text: &str) -> Option<Self> {
        let lower = text.to_lowercase();
        Self::ALL.into_iter().find(|nation| {
            lower.contains(nation.icon())
                || lower.contains(&nation.name_en().to_lowercase())
                || lower.contains(&nation.name_pt().to_lowercase())
        })
    }
}

// ============================================================================
// Ranking Rows
// ============================================================================

/// 파워 랭킹 행
#[derive(Debug, Clone, PartialEq)]
pub struct PowerEntry {
    pub position: u32,
    pub class: Option<CharacterClass>,
    pub name: String,
    pub guild: String,
    pub attack_power: u64,
    pub defense_power: u64,
    pub total_power: u64,
    pub nation: Option<Nation>,
}

/// 길드 랭킹 행
#[derive(Debug, Clone, PartialEq)]
pub struct GuildEntry {
    pub position: u32,
    pub name: String,
    pub power: u64,
    pub members: u64,
    pub war_points: u64,
    pub war_kills: u64,
}

/// 메모리얼 랭킹 카드
#[derive(Debug, Clone, PartialEq)]
pub struct MemorialEntry {
    pub position: u32,
    pub character_name: String,
    pub class: Option<CharacterClass>,
    pub guild_name: String,
    pub nation: Option<Nation>,
}

/// 파싱된 랭킹 행
#[derive(Debug, Clone, PartialEq)]
pub enum RankingRow {
    Power(PowerEntry),
    Guild(GuildEntry),
    Memorial(MemorialEntry),
}

impl RankingRow {
    pub fn position(&self) -> u32 {
        match self {
            RankingRow::Power(e) => e.position,
            RankingRow::Guild(e) => e.position,
            RankingRow::Memorial(e) => e.position,
        }
    }

    pub fn ranking_type(&self) -> &'static str {
        match self {
            RankingRow::Power(_) => "power",
            RankingRow::Guild(_) => "guild",
            RankingRow::Memorial(_) => "memorial",
        }
    }

    pub fn class(&self) -> Option<CharacterClass> {
        match self {
            RankingRow::Power(e) => e.class,
            RankingRow::Memorial(e) => e.class,
            RankingRow::Guild(_) => None,
        }
    }

    /// 검색용 텍스트 렌더링
    pub fn render(&self) -> String {
        match self {
            RankingRow::Power(e) => format!(
                "Rank: {}\nPlayer: {}\nClasse: {}\nGuild: {}\nPoder Total: {}\nPoder de Ataque: {}\nPoder de Defesa: {}\nNação: {}",
                e.position,
                e.name,
                class_label(e.class),
                e.guild,
                group_thousands(e.total_power),
                group_thousands(e.attack_power),
                group_thousands(e.defense_power),
                nation_label(e.nation),
            ),
            RankingRow::Guild(e) => format!(
                "Rank: {}\nGuild: {}\nPoder: {}\nMembros: {}\nPontos de Guerra: {}\nAbates na Guerra: {}",
                e.position,
                e.name,
                group_thousands(e.power),
                e.members,
                group_thousands(e.war_points),
                group_thousands(e.war_kills),
            ),
            RankingRow::Memorial(e) => format!(
                "Rank: {}\nPlayer: {}\nClasse: {}\nGuild: {}\nNação: {}",
                e.position,
                e.character_name,
                class_label(e.class),
                e.guild_name,
                nation_label(e.nation),
            ),
        }
    }
}

fn class_label(class: Option<CharacterClass>) -> String {
    class
        .map(|c| format!("{} ({})", c.name_pt(), c.abbr()))
        .unwrap_or_else(|| "Desconhecida".to_string())
}

fn nation_label(nation: Option<Nation>) -> &'static str {
    nation.map(Nation::name_pt).unwrap_or("Desconhecida")
}

// ============================================================================
// Parsers
// ============================================================================

fn selector(css: &str) -> Result<Selector> {
    Selector::parse(css).map_err(|e| anyhow::anyhow!("Invalid selector {}: {:?}", css, e))
}

fn cell_text(cell: &ElementRef) -> String {
    cell.text().collect::<String>().trim().to_string()
}

/// 셀 안 첫 번째 이미지의 srcset(없으면 src)
fn image_source(cell: &ElementRef, img: &Selector) -> Option<String> {
    cell.select(img).next().and_then(|el| {
        el.value()
            .attr("srcset")
            .or_else(|| el.value().attr("src"))
            .map(str::to_string)
    })
}

/// 파워 랭킹 테이블 파싱
///
/// 헤더 행을 건너뛰고 7개 이상의 셀을 가진 행만 읽습니다.
/// 셀 순서: #, 클래스 아이콘, 이름, 길드, 공격력, 방어력, 총 파워, 국가
pub fn parse_power_ranking(html: &str) -> Result<Vec<PowerEntry>> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;
    let img_sel = selector("img")?;

    let mut entries = Vec::new();
    for row in document.select(&row_sel).skip(1) {
        let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
        if cells.len() < 7 {
            continue;
        }

        let class = image_source(&cells[1], &img_sel)
            .and_then(|src| CharacterClass::from_icon_src(&src))
            .or_else(|| CharacterClass::lookup(&cell_text(&cells[1])));
        let nation = cells.get(7).and_then(|cell| {
            image_source(cell, &img_sel)
                .and_then(|src| Nation::detect(&src))
                .or_else(|| Nation::detect(&cell_text(cell)))
        });

        entries.push(PowerEntry {
            position: entries.len() as u32 + 1,
            class,
            name: cell_text(&cells[2]),
            guild: cell_text(&cells[3]),
            attack_power: parse_value(&cell_text(&cells[4])),
            defense_power: parse_value(&cell_text(&cells[5])),
            total_power: parse_value(&cell_text(&cells[6])),
            nation,
        });
    }

    tracing::debug!("Parsed {} power ranking rows", entries.len());
    Ok(entries)
}

/// 길드 랭킹 테이블 파싱
///
/// 셀 순서: #, 이름, 파워, 멤버, 전쟁 포인트, 전쟁 킬
pub fn parse_guild_ranking(html: &str) -> Result<Vec<GuildEntry>> {
    let document = Html::parse_document(html);
    let row_sel = selector("tr")?;
    let cell_sel = selector("td")?;

    let mut entries = Vec::new();
    for row in document.select(&row_sel).skip(1) {
        let cells: Vec<ElementRef> = row.select(&cell_sel).collect();
        if cells.len() < 6 {
            continue;
        }

        entries.push(GuildEntry {
            position: entries.len() as u32 + 1,
            name: cell_text(&cells[1]),
            power: parse_value(&cell_text(&cells[2])),
            members: parse_value(&cell_text(&cells[3])),
            war_points: parse_value(&cell_text(&cells[4])),
            war_kills: parse_value(&cell_text(&cells[5])),
        });
    }

    tracing::debug!("Parsed {} guild ranking rows", entries.len());
    Ok(entries)
}

/// 메모리얼 랭킹 카드 파싱
pub fn parse_memorial_ranking(html: &str) -> Result<Vec<MemorialEntry>> {
    let document = Html::parse_document(html);
    let card_sel = selector("div.rounded-md.border-2.text-card-foreground")?;
    let name_sel = selector("h2.font-bold")?;
    let guild_sel = selector("p.text-muted-foreground")?;
    let class_sel = selector(r#"img[alt^="Icon"]"#)?;
    let nation_sel = selector(r#"img[alt="Icon Nation"]"#)?;

    let mut entries = Vec::new();
    for card in document.select(&card_sel) {
        let Some(name) = card.select(&name_sel).next().map(|el| cell_text(&el)) else {
            continue;
        };
        let guild_name = card
            .select(&guild_sel)
            .next()
            .map(|el| cell_text(&el))
            .unwrap_or_default();

        let nation = image_source(&card, &nation_sel).and_then(|src| Nation::detect(&src));
        let class = card
            .select(&class_sel)
            .filter(|img| img.value().attr("alt") != Some("Icon Nation"))
            .find_map(|img| {
                img.value()
                    .attr("srcset")
                    .or_else(|| img.value().attr("src"))
                    .and_then(CharacterClass::from_icon_src)
            });

        entries.push(MemorialEntry {
            position: entries.len() as u32 + 1,
            character_name: name,
            class,
            guild_name,
            nation,
        });
    }

    tracing::debug!("Parsed {} memorial ranking cards", entries.len());
    Ok(entries)
}

/// 브라질식 숫자 표기 파싱 ("1.234.567" -> 1234567, "12,5" -> 12)
///
/// 해석할 수 없으면 0을 반환합니다.
pub fn parse_value(raw: &str) -> u64 {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == ',')
        .collect();
    let normalized = cleaned.replace('.', "").replace(',', ".");
    normalized
        .parse::<f64>()
        .map(|v| if v.is_finite() && v > 0.0 { v as u64 } else { 0 })
        .unwrap_or(0)
}

/// 천 단위 구분 (1234567 -> "1,234,567")
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_lookup_by_alternate_keys() {
        assert_eq!(CharacterClass::lookup("EA"), Some(CharacterClass::ForceBlader));
        assert_eq!(CharacterClass::lookup("fb"), Some(CharacterClass::ForceBlader));
        assert_eq!(CharacterClass::lookup("Icon FB"), Some(CharacterClass::ForceBlader));
        assert_eq!(
            CharacterClass::lookup("espadachim arcano"),
            Some(CharacterClass::ForceBlader)
        );
        assert_eq!(CharacterClass::lookup("Dark Mage"), Some(CharacterClass::DarkMage));
        assert_eq!(CharacterClass::lookup("9"), Some(CharacterClass::DarkMage));
        assert_eq!(CharacterClass::lookup("paladin"), None);
    }

    #[test]
    fn test_class_keys_are_unambiguous() {
        for class in CharacterClass::ALL {
            assert_eq!(CharacterClass::lookup(class.abbr()), Some(class));
            assert_eq!(CharacterClass::lookup(class.icon()), Some(class));
            assert_eq!(CharacterClass::lookup(class.name_pt()), Some(class));
        }
    }

    #[test]
    fn test_class_from_icon_src() {
        let src = "/_next/image?url=%2Franking%2Ficon-wz.png&w=32 1x, /ranking/icon-wz.png 2x";
        assert_eq!(CharacterClass::from_icon_src(src), Some(CharacterClass::Wizard));
        assert_eq!(CharacterClass::from_icon_src("/ranking/none.png"), None);
    }

    #[test]
    fn test_nation_detect() {
        assert_eq!(Nation::detect("/img/icon-capella.png 1x"), Some(Nation::Capella));
        assert_eq!(Nation::detect("Procion"), Some(Nation::Procyon));
        assert_eq!(Nation::lookup("procyon"), Some(Nation::Procyon));
        assert_eq!(Nation::detect("neutral"), None);
    }

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("1.234.567"), 1_234_567);
        assert_eq!(parse_value("12,5"), 12);
        assert_eq!(parse_value("Poder: 980"), 980);
        assert_eq!(parse_value("-"), 0);
    }

    #[test]
    fn test_group_thousands() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }

    #[test]
    fn test_parse_power_ranking() {
        let html = r#"
            <table>
              <tr><th>#</th><th>Classe</th><th>Nome</th><th>Guilda</th><th>Ataque</th><th>Defesa</th><th>Total</th><th>Nação</th></tr>
              <tr>
                <td>1</td>
                <td><img srcset="/ranking/icon-fb.png 1x" alt="Icon FB"></td>
                <td>Kaze</td><td>Aurora</td>
                <td>1.200</td><td>800</td><td>2.000</td>
                <td><img srcset="/ranking/icon-capella.png 1x" alt="Logo nation"></td>
              </tr>
              <tr><td>incomplete</td></tr>
            </table>
        "#;

        let entries = parse_power_ranking(html).unwrap();
        assert_eq!(entries.len(), 1);
        let first = &entries[0];
        assert_eq!(first.class, Some(CharacterClass::ForceBlader));
        assert_eq!(first.name, "Kaze");
        assert_eq!(first.total_power, 2000);
        assert_eq!(first.nation, Some(Nation::Capella));

        let text = RankingRow::Power(first.clone()).render();
        assert!(text.contains("Classe: Espadachim Arcano (EA)"));
        assert!(text.contains("Poder Total: 2,000"));
    }

    #[test]
    fn test_parse_guild_ranking() {
        let html = r#"
            <table>
              <tr><th>#</th><th>Nome</th><th>Poder</th><th>Membros</th><th>Pontos</th><th>Abates</th></tr>
              <tr><td>1</td><td>Aurora</td><td>10.500</td><td>42</td><td>3.000</td><td>150</td></tr>
              <tr><td>2</td><td>Nox</td><td>9.000</td><td>30</td><td>1.000</td><td>90</td></tr>
            </table>
        "#;

        let entries = parse_guild_ranking(html).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].position, 2);
        assert_eq!(entries[0].power, 10_500);
        assert_eq!(entries[0].members, 42);
    }

    #[test]
    fn test_parse_memorial_ranking() {
        let html = r#"
            <div class="rounded-md border-2 text-card-foreground">
              <h2 class="font-bold">Lyra</h2>
              <p class="text-muted-foreground">Aurora</p>
              <img alt="Icon WZ" srcset="/ranking/icon-wz.png 1x">
              <img alt="Icon Nation" srcset="/ranking/icon-procyon.png 1x">
            </div>
        "#;

        let entries = parse_memorial_ranking(html).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].character_name, "Lyra");
        assert_eq!(entries[0].class, Some(CharacterClass::Wizard));
        assert_eq!(entries[0].nation, Some(Nation::Procyon));
    }
}
