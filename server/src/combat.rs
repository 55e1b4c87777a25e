//! Damage resolution between two combatants.
//!
//! Everything here is pure: the caller hands in stat snapshots (buffs already
//! folded in), the defender's remaining health, the matchup looked up from
//! the advantage table and a random source.

use rand::Rng;

/// Percentage of attack below which base damage is lifted.
const BASE_FLOOR_RATIO: f64 = 0.5;
/// What base damage is lifted to, as a ratio of attack.
const BASE_LIFT_RATIO: f64 = 0.9;
const LEVEL_TERM_PER_LEVEL: f64 = 0.01;
/// Attribute/element experience at which the advantage bonus stops growing.
pub const ADVANTAGE_EXP_CAP: u32 = 10_000;
const ADVANTAGE_MAX_BONUS: f64 = 1.0;
const DISADVANTAGE_TERM: f64 = -0.25;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Attribute {
    None,
    Vaccine,
    Data,
    Virus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    Neutral,
    Fire,
    Water,
    Wind,
    Land,
    Light,
    Dark,
}

/// Stat snapshot of one combatant.
#[derive(Debug, Clone, PartialEq)]
pub struct CombatStats {
    pub level: u16,
    pub attack: u32,
    pub defense: u32,
    pub accuracy: u32,
    pub evasion: u32,
    /// Percent chance, 0..=100.
    pub critical_chance: f64,
    /// Critical damage stat; the bonus is `base * (value / 100) / 100`.
    pub critical_damage: f64,
    /// Percent chance to block, 0..=100.
    pub block: f64,
    pub attack_speed_ms: u64,
    pub attribute: Attribute,
    pub element: Element,
    pub attribute_exp: u32,
    pub element_exp: u32,
}

impl Default for CombatStats {
    fn default() -> Self {
        Self {
            level: 1,
            attack: 100,
            defense: 50,
            accuracy: 100,
            evasion: 10,
            critical_chance: 5.0,
            critical_damage: 5000.0,
            block: 5.0,
            attack_speed_ms: 2000,
            attribute: Attribute::None,
            element: Element::Neutral,
            attribute_exp: 0,
            element_exp: 0,
        }
    }
}

/// Who holds the advantage on one axis of a matchup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Attacker,
    Defender,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Matchup {
    pub attribute: Edge,
    pub element: Edge,
}

impl Matchup {
    pub const NEUTRAL: Matchup = Matchup {
        attribute: Edge::Neutral,
        element: Edge::Neutral,
    };
}

/// "X beats Y" relations, loaded as static content.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdvantageTable {
    pub attributes: Vec<(Attribute, Attribute)>,
    pub elements: Vec<(Element, Element)>,
}

impl AdvantageTable {
    fn edge<T: PartialEq + Copy>(pairs: &[(T, T)], attacker: T, defender: T) -> Edge {
        if pairs.contains(&(attacker, defender)) {
            Edge::Attacker
        } else if pairs.contains(&(defender, attacker)) {
            Edge::Defender
        } else {
            Edge::Neutral
        }
    }

    pub fn matchup(&self, attacker: &CombatStats, defender: &CombatStats) -> Matchup {
        Matchup {
            attribute: Self::edge(&self.attributes, attacker.attribute, defender.attribute),
            element: Self::edge(&self.elements, attacker.element, defender.element),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hit {
    pub damage: u32,
    pub critical: bool,
    pub blocked: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Missed,
    Hit(Hit),
}

/// Base damage before any bonus: attack minus defense, lifted to 90% of
/// attack whenever it drops below half of it.
pub fn base_damage(attack: u32, defense: u32) -> f64 {
    let attack = attack as f64;
    let base = attack - defense as f64;
    if base < attack * BASE_FLOOR_RATIO {
        attack * BASE_LIFT_RATIO
    } else {
        base
    }
}

pub fn level_term(attacker_level: u16, defender_level: u16) -> f64 {
    if attacker_level > defender_level {
        LEVEL_TERM_PER_LEVEL * f64::from(attacker_level - defender_level)
    } else {
        0.0
    }
}

pub fn advantage_term(edge: Edge, experience: u32) -> f64 {
    match edge {
        Edge::Attacker => {
            ADVANTAGE_MAX_BONUS * f64::from(experience.min(ADVANTAGE_EXP_CAP))
                / f64::from(ADVANTAGE_EXP_CAP)
        }
        Edge::Defender => DISADVANTAGE_TERM,
        Edge::Neutral => 0.0,
    }
}

/// Accuracy-versus-evasion roll made before any damage is computed.
pub fn roll_hit<R: Rng + ?Sized>(accuracy: u32, evasion: u32, rng: &mut R) -> bool {
    if evasion == 0 {
        return true;
    }
    let chance = f64::from(accuracy) / (f64::from(accuracy) + f64::from(evasion));
    rng.gen::<f64>() < chance
}

/// Damage dealt by a landed attack. Never below 1, never above
/// `defender_hp`.
pub fn resolve_damage<R: Rng + ?Sized>(
    attacker: &CombatStats,
    defender: &CombatStats,
    defender_hp: u32,
    matchup: Matchup,
    rng: &mut R,
) -> Hit {
    let base = base_damage(attacker.attack, defender.defense);

    let critical = rng.gen::<f64>() < attacker.critical_chance / 100.0;
    let critical_bonus = if critical {
        base * (attacker.critical_damage / 100.0) / 100.0
    } else {
        0.0
    };

    let blocked = rng.gen::<f64>() * 100.0 < defender.block;
    // Blocking halves the base term only; every bonus uses the unblocked base.
    let base_term = if blocked { base / 2.0 } else { base };

    let level = level_term(attacker.level, defender.level);
    let attribute = advantage_term(matchup.attribute, attacker.attribute_exp);
    let element = advantage_term(matchup.element, attacker.element_exp);

    let total =
        (base_term + critical_bonus + base * level + base * attribute + base * element).floor();
    let damage = if total < 1.0 { 1 } else { total.min(u32::MAX as f64) as u32 };

    Hit {
        damage: damage.min(defender_hp),
        critical,
        blocked,
    }
}

/// One attack attempt: hit roll, then damage.
pub fn engage<R: Rng + ?Sized>(
    attacker: &CombatStats,
    defender: &CombatStats,
    defender_hp: u32,
    matchup: Matchup,
    rng: &mut R,
) -> Outcome {
    if !roll_hit(attacker.accuracy, defender.evasion, rng) {
        return Outcome::Missed;
    }
    Outcome::Hit(resolve_damage(attacker, defender, defender_hp, matchup, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn plain(attack: u32, defense: u32) -> CombatStats {
        CombatStats {
            attack,
            defense,
            critical_chance: 0.0,
            block: 0.0,
            ..CombatStats::default()
        }
    }

    #[test]
    fn test_base_damage_floor_lift() {
        assert_approx_eq!(base_damage(1000, 2000), 900.0);
        assert_approx_eq!(base_damage(1000, 600), 900.0);
        assert_approx_eq!(base_damage(1000, 500), 500.0);
        assert_approx_eq!(base_damage(1000, 100), 900.0);
        assert_approx_eq!(base_damage(1000, 0), 1000.0);
    }

    #[test]
    fn test_tanky_defender_scenario() {
        let mut rng = StdRng::seed_from_u64(7);
        let attacker = plain(1000, 0);
        let defender = plain(0, 2000);

        let hit = resolve_damage(&attacker, &defender, 100_000, Matchup::NEUTRAL, &mut rng);
        assert_eq!(hit.damage, 900);
        assert!(!hit.critical);
        assert!(!hit.blocked);
    }

    #[test]
    fn test_critical_uses_critical_damage_stat() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut attacker = plain(1000, 0);
        attacker.critical_chance = 100.0;
        attacker.critical_damage = 5000.0;
        let defender = plain(0, 0);

        let hit = resolve_damage(&attacker, &defender, 100_000, Matchup::NEUTRAL, &mut rng);
        assert!(hit.critical);
        // 1000 + 1000 * 50 / 100
        assert_eq!(hit.damage, 1500);
    }

    #[test]
    fn test_block_halves_base_but_not_critical_bonus() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut attacker = plain(1000, 0);
        attacker.critical_chance = 100.0;
        attacker.critical_damage = 5000.0;
        let mut defender = plain(0, 0);
        defender.block = 100.0;

        let hit = resolve_damage(&attacker, &defender, 100_000, Matchup::NEUTRAL, &mut rng);
        assert!(hit.critical);
        assert!(hit.blocked);
        // 1000 / 2 + 500
        assert_eq!(hit.damage, 1000);
    }

    #[test]
    fn test_level_and_advantage_terms() {
        assert_approx_eq!(level_term(30, 20), 0.1);
        assert_approx_eq!(level_term(10, 20), 0.0);
        assert_approx_eq!(advantage_term(Edge::Attacker, 5_000), 0.5);
        assert_approx_eq!(advantage_term(Edge::Attacker, 50_000), 1.0);
        assert_approx_eq!(advantage_term(Edge::Defender, 50_000), -0.25);
        assert_approx_eq!(advantage_term(Edge::Neutral, 50_000), 0.0);
    }

    #[test]
    fn test_full_formula() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut attacker = plain(1000, 0);
        attacker.level = 25;
        attacker.attribute_exp = 2_500;
        let mut defender = plain(0, 0);
        defender.level = 20;
        let matchup = Matchup {
            attribute: Edge::Attacker,
            element: Edge::Defender,
        };

        let hit = resolve_damage(&attacker, &defender, 100_000, matchup, &mut rng);
        // 1000 + 1000*0.05 + 1000*0.25 - 1000*0.25
        assert_eq!(hit.damage, 1050);
    }

    #[test]
    fn test_damage_capped_at_remaining_health() {
        let mut rng = StdRng::seed_from_u64(4);
        let hit = resolve_damage(&plain(1000, 0), &plain(0, 0), 37, Matchup::NEUTRAL, &mut rng);
        assert_eq!(hit.damage, 37);
    }

    #[test]
    fn test_damage_never_below_one() {
        let mut rng = StdRng::seed_from_u64(5);
        let hit = resolve_damage(&plain(0, 0), &plain(0, 5000), 100, Matchup::NEUTRAL, &mut rng);
        assert_eq!(hit.damage, 1);
    }

    #[test]
    fn test_damage_bounds_over_many_combinations() {
        let mut rng = StdRng::seed_from_u64(99);
        let edges = [Edge::Attacker, Edge::Defender, Edge::Neutral];

        for _ in 0..5_000 {
            let attacker = CombatStats {
                level: rng.gen_range(1..=120),
                attack: rng.gen_range(0..=20_000),
                critical_chance: rng.gen_range(0.0..=100.0),
                critical_damage: rng.gen_range(0.0..=20_000.0),
                attribute_exp: rng.gen_range(0..=20_000),
                element_exp: rng.gen_range(0..=20_000),
                ..CombatStats::default()
            };
            let defender = CombatStats {
                level: rng.gen_range(1..=120),
                defense: rng.gen_range(0..=40_000),
                block: rng.gen_range(0.0..=100.0),
                ..CombatStats::default()
            };
            let matchup = Matchup {
                attribute: edges[rng.gen_range(0..3)],
                element: edges[rng.gen_range(0..3)],
            };
            let hp = rng.gen_range(1..=1_000_000);

            let hit = resolve_damage(&attacker, &defender, hp, matchup, &mut rng);
            assert!(hit.damage >= 1);
            assert!(hit.damage <= hp);
        }
    }

    #[test]
    fn test_roll_hit_extremes() {
        let mut rng = StdRng::seed_from_u64(6);
        for _ in 0..100 {
            assert!(roll_hit(10, 0, &mut rng));
            assert!(!roll_hit(0, 10, &mut rng));
        }
    }

    #[test]
    fn test_engage_miss() {
        let mut rng = StdRng::seed_from_u64(8);
        let attacker = CombatStats {
            accuracy: 0,
            ..plain(1000, 0)
        };
        let defender = CombatStats {
            evasion: 100,
            ..plain(0, 0)
        };
        assert_eq!(
            engage(&attacker, &defender, 100, Matchup::NEUTRAL, &mut rng),
            Outcome::Missed
        );
    }

    #[test]
    fn test_advantage_table_lookup() {
        let table = AdvantageTable {
            attributes: vec![(Attribute::Vaccine, Attribute::Virus)],
            elements: vec![(Element::Fire, Element::Wind)],
        };
        let mut a = CombatStats::default();
        let mut d = CombatStats::default();
        a.attribute = Attribute::Vaccine;
        d.attribute = Attribute::Virus;
        a.element = Element::Wind;
        d.element = Element::Fire;

        let m = table.matchup(&a, &d);
        assert_eq!(m.attribute, Edge::Attacker);
        assert_eq!(m.element, Edge::Defender);
        assert_eq!(table.matchup(&d, &d), Matchup::NEUTRAL);
    }
}
