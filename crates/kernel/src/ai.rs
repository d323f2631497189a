//! Finite-state controller for autonomous creatures.
//!
//! States: `Idle`, `Moving` and `Fleeing`. Moves are always one tile to a
//! cardinal neighbor; both move states return to `Idle` once the target pixel
//! position is reached, no valid move exists, or the move times out.

use glam::Vec2;
use meetup_common::{EntityId, TILE_SIZE, tile_origin, to_tile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::terrain::TerrainOracle;

/// Seconds between idle decisions.
pub const DECISION_INTERVAL: f32 = 2.0;
/// Chance an idle decision starts a move.
pub const MOVE_PROBABILITY: f32 = 0.6;
/// Idle durations are drawn from this range, in seconds.
pub const IDLE_MIN: f32 = 1.5;
pub const IDLE_MAX: f32 = 4.0;
/// A tracked player closer than this triggers fleeing.
pub const FLEE_RANGE: f32 = 150.0;
/// A neighbor tile is rejected when another AI entity is this close to it.
pub const MIN_SEPARATION: f32 = 2.0 * TILE_SIZE;
/// Moves still unfinished after this many seconds are abandoned.
pub const MOVE_TIMEOUT: f32 = 1.5;

/// Neighbor offsets in evaluation order: down, up, left, right.
/// Tile y grows upward, so "down" is `y - 1`.
pub const NEIGHBOR_ORDER: [(i32, i32); 4] = [(0, -1), (0, 1), (-1, 0), (1, 0)];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AiState {
    Idle,
    Moving,
    Fleeing,
}

/// Answers "is another AI-driven entity near here?" for the separation rule.
pub trait Crowd {
    fn ai_entity_within(&self, position: Vec2, radius: f32, exclude: EntityId) -> bool;
}

/// No other entities at all.
pub struct EmptyCrowd;

impl Crowd for EmptyCrowd {
    fn ai_entity_within(&self, _position: Vec2, _radius: f32, _exclude: EntityId) -> bool {
        false
    }
}

/// Everything an AI decision may look at during one tick.
pub struct AiContext<'a> {
    pub terrain: &'a dyn TerrainOracle,
    pub player: Option<Vec2>,
    pub crowd: &'a dyn Crowd,
}

/// Mutable body the controller steers.
pub struct Body<'a> {
    pub id: EntityId,
    pub position: &'a mut Vec2,
    /// Unit direction; the owner scales it by its speed.
    pub velocity: &'a mut Vec2,
    pub speed: f32,
}

#[derive(Debug, Clone)]
pub struct AiController {
    state: AiState,
    decision_timer: f32,
    state_timer: f32,
    idle_duration: f32,
    target: Option<Vec2>,
    paused: bool,
    rng: StdRng,
}

impl AiController {
    pub fn new(seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let idle_duration = rng.random_range(IDLE_MIN..IDLE_MAX);
        Self {
            state: AiState::Idle,
            decision_timer: 0.0,
            state_timer: 0.0,
            idle_duration,
            target: None,
            paused: false,
            rng,
        }
    }

    pub fn state(&self) -> AiState {
        self.state
    }

    /// Pixel position of the current move target, if moving.
    pub fn target(&self) -> Option<Vec2> {
        self.target
    }

    pub fn idle_duration(&self) -> f32 {
        self.idle_duration
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// While paused, `update` does nothing: no timers advance, no transitions.
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub fn update(&mut self, body: Body<'_>, ctx: &AiContext<'_>, dt: f32) {
        if self.paused {
            return;
        }
        self.decision_timer += dt;
        self.state_timer += dt;

        if self.state != AiState::Fleeing {
            if let Some(player) = ctx.player {
                if body.position.distance(player) < FLEE_RANGE {
                    self.flee(body.id, *body.position, player, ctx);
                }
            }
        }

        match self.state {
            AiState::Idle => {
                *body.velocity = Vec2::ZERO;
                if self.decision_timer >= DECISION_INTERVAL && self.state_timer >= self.idle_duration
                {
                    self.decision_timer = 0.0;
                    if self.rng.random::<f32>() < MOVE_PROBABILITY {
                        self.choose_new_target(body.id, *body.position, ctx);
                    } else {
                        self.enter_idle();
                    }
                }
            }
            AiState::Moving | AiState::Fleeing => self.steer(body, dt),
        }
    }

    /// Take the first cardinal neighbor that is passable and not crowded by
    /// another AI entity; go idle when there is none.
    pub fn choose_new_target(&mut self, id: EntityId, position: Vec2, ctx: &AiContext<'_>) {
        let (tx, ty) = (to_tile(position.x), to_tile(position.y));
        for (dx, dy) in NEIGHBOR_ORDER {
            let (nx, ny) = (tx + dx, ty + dy);
            if !ctx.terrain.is_passable(nx, ny) {
                continue;
            }
            let pixel = Vec2::new(tile_origin(nx), tile_origin(ny));
            if ctx.crowd.ai_entity_within(pixel, MIN_SEPARATION, id) {
                continue;
            }
            self.start_move(AiState::Moving, pixel);
            tracing::debug!(entity = %id, tile_x = nx, tile_y = ny, "creature picked a move target");
            return;
        }
        tracing::debug!(entity = %id, "no valid move; staying idle");
        self.enter_idle();
    }

    fn flee(&mut self, id: EntityId, position: Vec2, player: Vec2, ctx: &AiContext<'_>) {
        let (tx, ty) = (to_tile(position.x), to_tile(position.y));
        let dx = tx - to_tile(player.x);
        let dy = ty - to_tile(player.y);
        let away = |offset: i32| if offset >= 0 { 1 } else { -1 };
        let (nx, ny) = if dx.abs() >= dy.abs() {
            (tx + away(dx), ty)
        } else {
            (tx, ty + away(dy))
        };

        if ctx.terrain.is_passable(nx, ny) {
            let pixel = Vec2::new(tile_origin(nx), tile_origin(ny));
            self.start_move(AiState::Fleeing, pixel);
            tracing::debug!(entity = %id, tile_x = nx, tile_y = ny, "creature fleeing");
        } else {
            self.choose_new_target(id, position, ctx);
        }
    }

    fn steer(&mut self, body: Body<'_>, dt: f32) {
        let Some(target) = self.target else {
            self.enter_idle();
            return;
        };
        if self.state_timer > MOVE_TIMEOUT {
            tracing::debug!(entity = %body.id, "move timed out");
            *body.velocity = Vec2::ZERO;
            self.enter_idle();
            return;
        }
        let offset = target - *body.position;
        let step = body.speed * dt;
        if offset.length() <= step {
            *body.position = target;
            *body.velocity = Vec2::ZERO;
            self.enter_idle();
        } else {
            *body.velocity = offset.normalize_or_zero();
        }
    }

    fn start_move(&mut self, state: AiState, target: Vec2) {
        self.state = state;
        self.state_timer = 0.0;
        self.target = Some(target);
    }

    fn enter_idle(&mut self) {
        self.state = AiState::Idle;
        self.state_timer = 0.0;
        self.target = None;
        self.idle_duration = self.rng.random_range(IDLE_MIN..IDLE_MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terrain::{BlockedTiles, OpenTerrain};

    struct Occupied(Vec<Vec2>);

    impl Crowd for Occupied {
        fn ai_entity_within(&self, position: Vec2, radius: f32, _exclude: EntityId) -> bool {
            self.0.iter().any(|p| p.distance(position) < radius)
        }
    }

    fn tile(x: i32, y: i32) -> Vec2 {
        Vec2::new(tile_origin(x), tile_origin(y))
    }

    fn run(
        ai: &mut AiController,
        position: &mut Vec2,
        velocity: &mut Vec2,
        ctx: &AiContext<'_>,
        dt: f32,
    ) {
        let body = Body {
            id: EntityId::new(),
            position,
            velocity,
            speed: 100.0,
        };
        ai.update(body, ctx, dt);
    }

    #[test]
    fn first_valid_neighbor_is_down() {
        let mut ai = AiController::new(1);
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: None,
            crowd: &EmptyCrowd,
        };
        ai.choose_new_target(EntityId::new(), tile(5, 5), &ctx);
        assert_eq!(ai.state(), AiState::Moving);
        assert_eq!(ai.target(), Some(tile(5, 4)));
    }

    #[test]
    fn blocked_and_crowded_neighbors_are_skipped() {
        let terrain = BlockedTiles::from_tiles([(5, 4)]);
        // Another creature right next to the "up" neighbor.
        let crowd = Occupied(vec![tile(5, 7)]);
        let ctx = AiContext {
            terrain: &terrain,
            player: None,
            crowd: &crowd,
        };
        let mut ai = AiController::new(2);
        ai.choose_new_target(EntityId::new(), tile(5, 5), &ctx);
        assert_eq!(ai.target(), Some(tile(4, 5)));
    }

    #[test]
    fn boxed_in_creature_goes_idle() {
        let terrain = BlockedTiles::from_tiles([(5, 4), (5, 6)]);
        let crowd = Occupied(vec![tile(3, 5), tile(7, 5)]);
        let ctx = AiContext {
            terrain: &terrain,
            player: None,
            crowd: &crowd,
        };
        let mut ai = AiController::new(3);
        ai.choose_new_target(EntityId::new(), tile(5, 5), &ctx);
        assert_eq!(ai.state(), AiState::Idle);

        let mut position = tile(5, 5);
        let mut velocity = Vec2::ZERO;
        for _ in 0..100 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
            assert_eq!(ai.state(), AiState::Idle);
        }
        assert_eq!(position, tile(5, 5));
        assert_eq!(velocity, Vec2::ZERO);
    }

    #[test]
    fn blocked_flee_falls_back_to_idle() {
        let terrain = BlockedTiles::from_tiles([(0, -1), (0, 1), (-1, 0), (1, 0)]);
        let ctx = AiContext {
            terrain: &terrain,
            player: Some(Vec2::new(10.0, 0.0)),
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(11);
        let mut position = Vec2::ZERO;
        let mut velocity = Vec2::ZERO;
        for _ in 0..30 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
            assert_eq!(ai.state(), AiState::Idle);
        }
        assert_eq!(position, Vec2::ZERO);
    }

    #[test]
    fn nearby_player_triggers_flee_on_larger_axis() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: Some(tile(3, 4)),
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(4);
        let mut position = tile(5, 5);
        let mut velocity = Vec2::ZERO;
        run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);

        assert_eq!(ai.state(), AiState::Fleeing);
        assert_eq!(ai.target(), Some(tile(6, 5)));
        assert_eq!(velocity, Vec2::X);
    }

    #[test]
    fn flee_tie_prefers_x_and_positive_sign() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: Some(Vec2::new(10.0, 0.0)),
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(5);
        let mut position = Vec2::ZERO;
        let mut velocity = Vec2::ZERO;
        run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
        assert_eq!(ai.state(), AiState::Fleeing);
        assert_eq!(ai.target(), Some(tile(1, 0)));
    }

    #[test]
    fn distant_player_is_ignored() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: Some(Vec2::new(400.0, 0.0)),
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(6);
        let mut position = Vec2::ZERO;
        let mut velocity = Vec2::ZERO;
        run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
        assert_eq!(ai.state(), AiState::Idle);
    }

    #[test]
    fn move_completes_at_target_pixel() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: None,
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(7);
        ai.choose_new_target(EntityId::new(), tile(0, 0), &ctx);
        let target = ai.target().unwrap();

        let mut position = tile(0, 0);
        let mut velocity = Vec2::ZERO;
        for _ in 0..20 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.05);
            if ai.state() == AiState::Idle {
                break;
            }
            position += velocity * 100.0 * 0.05;
        }
        assert_eq!(ai.state(), AiState::Idle);
        assert_eq!(position, target);
    }

    #[test]
    fn stalled_move_times_out() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: None,
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(8);
        ai.choose_new_target(EntityId::new(), tile(0, 0), &ctx);
        let mut position = tile(0, 0);
        let mut velocity = Vec2::ZERO;
        // Never integrate the velocity, as if every step bounced back.
        for _ in 0..16 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
        }
        assert_eq!(ai.state(), AiState::Idle);
    }

    #[test]
    fn paused_controller_is_frozen() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: Some(Vec2::new(10.0, 0.0)),
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(9);
        ai.set_paused(true);
        let mut position = Vec2::ZERO;
        let mut velocity = Vec2::new(0.5, 0.5);
        for _ in 0..50 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
        }
        assert_eq!(ai.state(), AiState::Idle);
        assert_eq!(velocity, Vec2::new(0.5, 0.5));
        assert!(ai.is_paused());
    }

    #[test]
    fn idle_decisions_eventually_move() {
        let ctx = AiContext {
            terrain: &OpenTerrain,
            player: None,
            crowd: &EmptyCrowd,
        };
        let mut ai = AiController::new(10);
        let mut position = tile(0, 0);
        let mut velocity = Vec2::ZERO;
        let mut moved = false;
        for _ in 0..2_000 {
            run(&mut ai, &mut position, &mut velocity, &ctx, 0.1);
            if ai.state() == AiState::Moving {
                moved = true;
                break;
            }
        }
        assert!(moved);
    }

    #[test]
    fn same_seed_same_idle_durations() {
        let a = AiController::new(42);
        let b = AiController::new(42);
        assert_eq!(a.idle_duration(), b.idle_duration());
        assert!((IDLE_MIN..IDLE_MAX).contains(&a.idle_duration()));
    }
}
