//! End-to-end frames through the compositor.

use kpio_compositor::{
    Color, Compositor, CompositorConfig, CompositorError, DamageAccumulator, LayerHandle,
    ManualTimer, PixelBuffer, PixelFormat, Rect, RepaintPolicy, Resource, SimulatedDma,
    WaitPolicy,
};

type TestCompositor = Compositor<SimulatedDma, ManualTimer>;

fn compositor(config: CompositorConfig) -> TestCompositor {
    let engine = SimulatedDma::new(config.descriptor_table_size, 3);
    Compositor::with_heap(config, engine, ManualTimer::with_step(1)).unwrap()
}

fn solid(c: &mut TestCompositor, rect: Rect, color: Color) -> LayerHandle {
    let h = c.acquire_layer().expect("layer slot");
    c.configure_layer_pooled(h, rect).unwrap();
    c.buffer_mut(h).unwrap().fill(color);
    h
}

fn pixel(c: &TestCompositor, x: u32, y: u32) -> Color {
    c.framebuffer().pixel(x, y).unwrap()
}

/// Scenario A: the upper layer wins where two layers overlap.
#[test]
fn scenario_a_overlapping_layers() {
    for policy in [RepaintPolicy::LayerDirty, RepaintPolicy::DamageRegions] {
        let mut c = compositor(CompositorConfig {
            repaint_policy: policy,
            ..CompositorConfig::default()
        });
        let l0 = solid(&mut c, Rect::new(0, 0, 100, 100), Color::new(1));
        let l1 = solid(&mut c, Rect::new(50, 50, 100, 100), Color::new(2));
        assert_eq!(c.layer(l0).unwrap().z(), 0);
        assert_eq!(c.layer(l1).unwrap().z(), 1);

        c.run_frame().unwrap();
        assert_eq!(pixel(&c, 75, 75), Color::new(2));
        assert_eq!(pixel(&c, 10, 10), Color::new(1));
        assert_eq!(pixel(&c, 300, 300), Color::BLACK);
    }
}

/// Scenario A again, with both layers configured after the first frame so
/// the occlusion map decides what each layer copies.
#[test]
fn scenario_a_after_first_frame() {
    let mut c = compositor(CompositorConfig::default());
    c.run_frame().unwrap();

    solid(&mut c, Rect::new(0, 0, 100, 100), Color::new(1));
    solid(&mut c, Rect::new(50, 50, 100, 100), Color::new(2));
    let report = c.run_frame().unwrap();
    assert!(!report.full_paint);

    assert_eq!(pixel(&c, 75, 75), Color::new(2));
    assert_eq!(pixel(&c, 10, 10), Color::new(1));
    // Tiles under L1 were not copied from L0: 104x104 + 104x104 - 56x56 pixels
    assert_eq!(report.bytes, (104 * 104 * 2 - 56 * 56) / 2);
}

/// Scenario B: one rect past capacity is merged, never dropped.
#[test]
fn scenario_b_damage_overflow() {
    let mut damage = DamageAccumulator::new(640, 400, 8, 32, 50);
    for i in 0..32 {
        damage.add_rect((i % 8) * 80, (i / 8) * 80, 16, 16);
    }
    assert_eq!(damage.active_count(), 32);

    let extra = Rect::new(600, 360, 8, 8);
    damage.add(extra);
    assert_eq!(damage.active_count(), 32);
    assert_eq!(damage.stats.overflow_merges, 1);
    assert!(damage.regions().any(|r| r.contains_rect(&extra)));
    assert!(damage.bounding_box().contains_rect(&extra));
}

/// Scenario C: a dirty rect starting at the right edge changes nothing.
#[test]
fn scenario_c_mark_dirty_past_right_edge() {
    let mut c = compositor(CompositorConfig::default());
    let h = solid(&mut c, Rect::new(0, 0, 64, 32), Color::BLUE);
    c.run_frame().unwrap();

    let width = c.layer(h).unwrap().rect().width as i32;
    let changed = c.mark_dirty(h, Rect::new(width, 0, 10, 10)).unwrap();
    assert!(!changed);
    let layer = c.layer(h).unwrap();
    assert!(!layer.needs_redraw());
    assert!(layer.dirty_rect().is_empty());
}

#[test]
fn configure_then_frame_copies_layer_once() {
    let mut c = compositor(CompositorConfig::default());
    c.run_frame().unwrap();

    solid(&mut c, Rect::new(16, 16, 80, 40), Color::CYAN);
    let first = c.run_frame().unwrap();
    assert_eq!(first.bytes, 40 * 80 / 2);

    let second = c.run_frame().unwrap();
    assert!(!second.painted);
    assert_eq!(second.descriptors, 0);
    assert_eq!(second.bytes, 0);
}

#[test]
fn rows_coalesce_into_single_descriptors() {
    let mut c = compositor(CompositorConfig::default());
    c.run_frame().unwrap();
    solid(&mut c, Rect::new(0, 0, 128, 16), Color::RED);
    let report = c.run_frame().unwrap();
    // One descriptor per scanline, not one per tile
    assert_eq!(report.descriptors, 16);
}

#[test]
fn partial_redraw_copies_only_dirty_tiles() {
    let mut c = compositor(CompositorConfig::default());
    let h = solid(&mut c, Rect::new(0, 0, 128, 128), Color::BLUE);
    c.run_frame().unwrap();

    c.buffer_mut(h)
        .unwrap()
        .fill_rect(Rect::new(20, 20, 4, 4), Color::YELLOW);
    c.mark_dirty(h, Rect::new(20, 20, 4, 4)).unwrap();
    let report = c.run_frame().unwrap();

    // Widened to the 8x8 tile holding the rect
    assert_eq!(report.bytes, 8 * 4);
    assert_eq!(pixel(&c, 21, 21), Color::YELLOW);
    assert_eq!(pixel(&c, 16, 16), Color::BLUE);
}

#[test]
fn batch_size_does_not_change_output() {
    let build = |table: usize, threshold: usize| {
        let mut c = compositor(CompositorConfig {
            descriptor_table_size: table,
            cpu_copy_threshold: threshold,
            cpu_copy_threshold_min: 0,
            ..CompositorConfig::default()
        });
        c.run_frame().unwrap();
        let a = solid(&mut c, Rect::new(0, 0, 200, 120), Color::BLUE);
        let b = solid(&mut c, Rect::new(40, 24, 96, 200), Color::RED);
        solid(&mut c, Rect::new(120, 0, 16, 300), Color::GREEN);
        c.run_frame().unwrap();

        c.buffer_mut(a)
            .unwrap()
            .fill_rect(Rect::new(8, 8, 180, 100), Color::WHITE);
        c.mark_dirty(a, Rect::new(8, 8, 180, 100)).unwrap();
        c.move_layer(b, 200, 64).unwrap();
        c.run_frame().unwrap();
        c.framebuffer().as_bytes().to_vec()
    };

    let reference = build(1, 0);
    assert_eq!(build(16, 0), reference);
    assert_eq!(build(16, 256), reference);
    assert_eq!(build(3, 40), reference);
}

#[test]
fn hardware_timeout_keeps_layers_dirty() {
    let mut c = compositor(CompositorConfig {
        cpu_copy_threshold: 0,
        cpu_copy_threshold_min: 0,
        wait_policy: WaitPolicy::Bounded { max_polls: 32 },
        ..CompositorConfig::default()
    });
    c.run_frame().unwrap();

    let h = solid(&mut c, Rect::new(0, 0, 64, 64), Color::MAGENTA);
    c.scheduler_mut().engine_mut().set_stalled(true);
    let err = c.run_frame().unwrap_err();
    assert_eq!(err, CompositorError::HardwareTimeout { polls: 32 });
    assert!(c.layer(h).unwrap().needs_redraw());
    assert!(c.scheduler().pending().is_empty());
    assert_eq!(c.stats().failed_frames, 1);

    c.scheduler_mut().engine_mut().set_stalled(false);
    c.run_frame().unwrap();
    assert!(!c.layer(h).unwrap().needs_redraw());
    assert_eq!(pixel(&c, 63, 63), Color::MAGENTA);
}

#[test]
fn move_exposes_lower_layer_and_background() {
    for policy in [RepaintPolicy::LayerDirty, RepaintPolicy::DamageRegions] {
        let mut c = compositor(CompositorConfig {
            repaint_policy: policy,
            background: Color::DARK_GRAY,
            ..CompositorConfig::default()
        });
        solid(&mut c, Rect::new(0, 0, 64, 64), Color::BLUE);
        let top = solid(&mut c, Rect::new(32, 32, 64, 64), Color::RED);
        c.run_frame().unwrap();
        assert_eq!(pixel(&c, 40, 40), Color::RED);

        c.move_layer(top, 200, 200).unwrap();
        c.run_frame().unwrap();
        assert_eq!(pixel(&c, 40, 40), Color::BLUE);
        assert_eq!(pixel(&c, 80, 80), Color::DARK_GRAY);
        assert_eq!(pixel(&c, 210, 210), Color::RED);
    }
}

/// Layers pushed to the ends of the coordinate range leave the screen
/// without disturbing the frame.
#[test]
fn extreme_coordinates_are_ignored() {
    for policy in [RepaintPolicy::LayerDirty, RepaintPolicy::DamageRegions] {
        let mut c = compositor(CompositorConfig {
            repaint_policy: policy,
            background: Color::DARK_GRAY,
            ..CompositorConfig::default()
        });
        let low = solid(&mut c, Rect::new(0, 0, 32, 32), Color::BLUE);
        let high = solid(&mut c, Rect::new(64, 0, 32, 32), Color::RED);
        c.run_frame().unwrap();

        let spare = c.acquire_layer().unwrap();
        let err = c
            .configure_layer_pooled(spare, Rect::new(i32::MAX - 3, 0, 8, 8))
            .unwrap_err();
        assert!(matches!(err, CompositorError::InvalidGeometry { .. }));

        c.move_layer(low, i32::MIN, 0).unwrap();
        c.move_layer(high, i32::MAX - 3, i32::MAX - 3).unwrap();
        c.run_frame().unwrap();
        assert_eq!(pixel(&c, 8, 8), Color::DARK_GRAY);
        assert_eq!(pixel(&c, 72, 8), Color::DARK_GRAY);

        c.mark_dirty(low, Rect::new(0, 0, 32, 32)).unwrap();
        c.mark_dirty(high, Rect::new(0, 0, 32, 32)).unwrap();
        let report = c.run_frame().unwrap();
        assert_eq!(report.bytes, 0);

        let mut damage = DamageAccumulator::new(640, 400, 8, 32, 50);
        damage.add_rect(i32::MAX - 3, 0, 8, 8);
        damage.add_rect(i32::MIN, i32::MIN, u32::MAX, 8);
        assert_eq!(damage.active_count(), 0);
    }
}

#[test]
fn raising_a_layer_repaints_the_overlap() {
    let mut c = compositor(CompositorConfig::default());
    let bottom = solid(&mut c, Rect::new(0, 0, 64, 64), Color::BLUE);
    solid(&mut c, Rect::new(32, 32, 64, 64), Color::RED);
    c.run_frame().unwrap();

    c.set_z_order(bottom, 1).unwrap();
    c.run_frame().unwrap();
    assert_eq!(pixel(&c, 40, 40), Color::BLUE);
    assert_eq!(pixel(&c, 80, 80), Color::RED);
    assert!(c.layers().check_z_order());
}

#[test]
fn release_returns_buffers_and_exposes() {
    let mut c = compositor(CompositorConfig {
        background: Color::WHITE,
        ..CompositorConfig::default()
    });
    let pooled = solid(&mut c, Rect::new(0, 0, 32, 32), Color::BLUE);
    let owned = c.acquire_layer().unwrap();
    let mut buffer = PixelBuffer::new(32, 32, PixelFormat::Packed4);
    buffer.fill(Color::GREEN);
    c.configure_layer(owned, Rect::new(64, 0, 32, 32), buffer).unwrap();
    c.run_frame().unwrap();
    assert_eq!(pixel(&c, 70, 4), Color::GREEN);

    assert!(c.release_layer(pooled).unwrap().is_none());
    assert_eq!(c.layers().pool().lent_bytes(), 0);
    let returned = c.release_layer(owned).unwrap().expect("owned buffer");
    assert_eq!(returned.pixel(0, 0), Some(Color::GREEN));

    c.run_frame().unwrap();
    assert_eq!(pixel(&c, 4, 4), Color::WHITE);
    assert_eq!(pixel(&c, 70, 4), Color::WHITE);
    assert_eq!(
        c.mark_dirty(owned, Rect::new(0, 0, 8, 8)).unwrap_err(),
        CompositorError::InvalidHandle(owned)
    );
}

#[test]
fn exhausted_tables_fail_softly() {
    let mut c = compositor(CompositorConfig {
        max_layers: 2,
        pool_budget_bytes: 1024,
        ..CompositorConfig::default()
    });
    let a = c.acquire_layer().unwrap();
    c.acquire_layer().unwrap();
    assert!(c.acquire_layer().is_none());
    assert_eq!(
        c.try_acquire_layer().unwrap_err(),
        CompositorError::ResourceExhausted(Resource::LayerTable)
    );

    assert_eq!(
        c.configure_layer_pooled(a, Rect::new(0, 0, 128, 128)).unwrap_err(),
        CompositorError::ResourceExhausted(Resource::BufferPool)
    );
    c.run_frame().unwrap();
}

#[test]
fn hidden_layer_is_not_painted_until_shown() {
    let mut c = compositor(CompositorConfig::default());
    c.run_frame().unwrap();
    let h = solid(&mut c, Rect::new(0, 0, 16, 16), Color::LIGHT_RED);
    c.set_visible(h, false).unwrap();
    let report = c.run_frame().unwrap();
    assert_eq!(report.bytes, 0);
    assert_eq!(pixel(&c, 4, 4), Color::BLACK);

    c.set_visible(h, true).unwrap();
    c.run_frame().unwrap();
    assert_eq!(pixel(&c, 4, 4), Color::LIGHT_RED);
}

#[test]
fn threshold_adapts_to_load() {
    let mut c = compositor(CompositorConfig {
        threshold_recalc_frames: 2,
        busy_bytes_per_frame: 1024,
        ..CompositorConfig::default()
    });
    let h = solid(&mut c, Rect::new(0, 0, 256, 256), Color::BLUE);
    let baseline = c.scheduler().threshold().current();
    for _ in 0..4 {
        c.invalidate_layer(h).unwrap();
        c.run_frame().unwrap();
    }
    assert!(c.scheduler().threshold().current() < baseline);
    assert!(c.transfer_stats().recalculations >= 2);
}
