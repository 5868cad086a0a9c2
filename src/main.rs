//! bootui demo
//!
//! Brings up the display and input devices, shows a small menu and runs the
//! wait/dispatch loop until the user picks "Exit" or presses Q.

mod app;

use anyhow::{Context, Result};
use evdev::{InputEvent, InputEventKind};
use nix::errno::Errno;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::process;
use std::rc::Rc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use bootui::input::{get_input, Disposition, EventMultiplexer, InputError};
use bootui::kmsg::KmsgWriter;
use bootui::ui::{font_size, Graphics, Rotation};
use bootui::Config;

use app::{App, MenuAction};

const BACKGROUND: (u8, u8, u8) = (0, 0, 64);

fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("FATAL ERROR: {e}");
            process::exit(2);
        }
    };

    init_logging(config.log_to_kmsg);
    info!("bootui starting...");

    match run(&config) {
        Ok(()) => {
            info!("bootui exiting cleanly");
            process::exit(0);
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            eprintln!("\nFATAL ERROR: {:#}", e);
            process::exit(1);
        }
    }
}

fn init_logging(to_kmsg: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true);

    if to_kmsg {
        builder
            .with_ansi(false)
            .with_writer(KmsgWriter::default())
            .init();
    } else {
        builder.init();
    }
}

fn run(config: &Config) -> Result<()> {
    let mut app = App::new();

    info!("Initializing display...");
    let mut graphics = Graphics::init(&config.graphics).context("Failed to initialize display")?;
    if let Some(e) = graphics.font_error() {
        app.log_step(format!("[ERR] No font: {e}"));
    }
    app.log_step(format!(
        "[OK] Display: {} {}x{}",
        graphics.backend_kind(),
        graphics.width(),
        graphics.height()
    ));
    render(&app, &mut graphics)?;

    info!("Initializing input...");
    let queue: Rc<RefCell<VecDeque<InputEvent>>> = Rc::default();
    let sink = Rc::clone(&queue);
    let mut input = EventMultiplexer::init_from(
        &config.input.input_dir,
        move |_, fd, events| {
            match get_input(fd, events) {
                Ok(event) => sink.borrow_mut().push_back(event),
                Err(e) => debug!("Dropping unreadable input: {}", e),
            }
            Disposition::Keep
        },
        config.input.allow_touch,
    )
    .context("Failed to initialize input")?;

    let mut keys = Vec::new();
    input.iterate_available_keys(|code| keys.push(code));
    app.set_available_keys(&keys);
    app.log_step(format!("[OK] Input: {} device(s)", input.device_count()));
    log_held_inputs(&mut app, &input)?;

    info!("Entering main loop...");
    while !app.should_exit() {
        render(&app, &mut graphics)?;

        match input.wait(-1) {
            Ok(_) => input.dispatch(),
            Err(InputError::Sys(Errno::EINTR)) => continue,
            Err(e) => return Err(e).context("Waiting for input failed"),
        }

        while let Some(event) = queue.borrow_mut().pop_front() {
            if let InputEventKind::Key(key) = event.kind() {
                app.handle_key(key, event.value());
            }
        }

        if let Some(action) = app.take_pending() {
            if let Err(e) = run_action(action, &mut app, &mut graphics, &input) {
                warn!("Action {:?} failed: {:#}", action, e);
                app.log_step(format!("[ERR] {e:#}"));
            }
        }
    }

    info!("Cleaning up...");
    input.exit();
    graphics.exit();
    Ok(())
}

fn run_action(
    action: MenuAction,
    app: &mut App,
    graphics: &mut Graphics,
    input: &EventMultiplexer,
) -> Result<()> {
    match action {
        MenuAction::GraphicsTest => {
            let original = graphics.rotation();
            for rotation in [Rotation::None, Rotation::Right, Rotation::Down, Rotation::Left] {
                graphics.set_rotation(rotation);
                draw_test_pattern(graphics, &format!("{rotation:?}"))?;
                thread::sleep(Duration::from_millis(750));
            }
            graphics.set_rotation(original);
            app.log_step("[OK] Graphics test done");
        }
        MenuAction::RotateDisplay => {
            graphics.rotate(Rotation::Right);
            app.log_step(format!("[OK] Rotation now {:?}", graphics.rotation()));
        }
        MenuAction::BlankDisplay => {
            for connector in 0..graphics.connector_count() {
                graphics.blank_connector(true, connector)?;
            }
            thread::sleep(Duration::from_secs(1));
            for connector in 0..graphics.connector_count() {
                graphics.blank_connector(false, connector)?;
            }
            app.log_step(format!(
                "[OK] Blanked {} connector(s)",
                graphics.connector_count()
            ));
        }
        MenuAction::ShowKeys => log_held_inputs(app, input)?,
        MenuAction::Exit => {}
    }
    Ok(())
}

fn log_held_inputs(app: &mut App, input: &EventMultiplexer) -> Result<()> {
    let mut held = Vec::new();
    input.sync_key_state(|code, _| {
        held.push(code);
        ControlFlow::Continue(())
    })?;
    let mut switches = Vec::new();
    input.sync_sw_state(|code, _| {
        switches.push(code);
        ControlFlow::Continue(())
    })?;
    app.log_step(format!("Held keys: {held:?}, active switches: {switches:?}"));
    Ok(())
}

fn draw_test_pattern(graphics: &mut Graphics, label: &str) -> Result<()> {
    let (width, height) = graphics.geometry();
    {
        let (mut canvas, font) = graphics.canvas_with_font()?;
        let bars = [
            (255, 255, 255),
            (255, 255, 0),
            (0, 255, 255),
            (0, 255, 0),
            (255, 0, 255),
            (255, 0, 0),
            (0, 0, 255),
        ];
        let bar_width = (width / bars.len()).max(1) as i32;
        for (i, (r, g, b)) in bars.into_iter().enumerate() {
            canvas.set_color(r, g, b, 255);
            let x = i as i32 * bar_width;
            canvas.fill(x, 0, x + bar_width, height as i32);
        }
        if font.is_some() {
            canvas.set_color(0, 0, 0, 255);
            canvas.text(font, 4, 4, label, true)?;
        }
    }
    graphics.present()?;
    Ok(())
}

/// Draw the menu and status log, then present
fn render(app: &App, graphics: &mut Graphics) -> Result<()> {
    let (width, _) = graphics.geometry();
    {
        let (mut canvas, font) = graphics.canvas_with_font()?;
        let (bg_r, bg_g, bg_b) = BACKGROUND;
        canvas.set_color(bg_r, bg_g, bg_b, 255);
        canvas.clear();

        let (cw, ch) = font_size(font);
        if font.is_some() && cw > 0 && ch > 0 {
            let line = ch + ch / 2;
            let mut y = ch;

            canvas.set_color(255, 255, 255, 255);
            canvas.text(font, cw, y, "bootui", true)?;
            y += line * 2;

            for (i, label) in app.menu_items().enumerate() {
                if i == app.highlight() {
                    canvas.set_color(255, 255, 255, 255);
                    canvas.fill(0, y - ch / 4, width as i32, y + ch + ch / 4);
                    canvas.set_color(bg_r, bg_g, bg_b, 255);
                } else {
                    canvas.set_color(255, 255, 255, 255);
                }
                canvas.text(font, cw, y, label, false)?;
                y += line;
            }

            y += line;
            canvas.set_color(160, 160, 160, 255);
            let columns = (width / cw as usize).saturating_sub(2);
            for status in app.status_lines(columns) {
                canvas.text(font, cw, y, &status, false)?;
                y += ch;
            }
        }
    }
    graphics.present()?;
    Ok(())
}
