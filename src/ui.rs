use anyhow::Result;
use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use log::debug;
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph},
    Frame,
};
use std::{
    io,
    time::{Duration, Instant},
};
use textwrap::wrap;
use tui_input::{backend::crossterm::EventHandler, Input};

use chitchathub::models::{Message, User};
use chitchathub::session::{Notice, NoticeLevel, SendState, SessionEvent};

pub use ratatui::backend::CrosstermBackend;
pub use ratatui::Terminal;

const EMPTY_STATE: &str = "No users in your chat list. Add one to start chatting!";

/// What the main loop should do after a key press
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiAction {
    Quit,
    SignOut,
    Send(String),
    Select(String),
    AddContact(String),
    RemoveContact(String),
    UpdateAvatar(String),
    Search(String),
}

enum Tab {
    Messages,
    Contacts,
}

struct ContactRemoveDialog {
    user_id: String,
    name: String,
}

struct Toast {
    notice: Notice,
    shown_at: Instant,
}

struct SearchResults {
    query: String,
    messages: Vec<Message>,
}

pub struct ChatUI {
    profile: User,
    contacts: Vec<User>,
    selected: Option<User>,
    messages: Vec<Message>,
    input: Input,
    active_tab: Tab,
    send_state: SendState,
    toast: Option<Toast>,
    search: Option<SearchResults>,
    contact_add_dialog: Option<Input>,
    contact_remove_dialog: Option<ContactRemoveDialog>,
    avatar_dialog: Option<Input>,
    search_dialog: Option<Input>,
    help_dialog: bool,
}

impl ChatUI {
    pub fn new(profile: User) -> Self {
        ChatUI {
            profile,
            contacts: Vec::new(),
            selected: None,
            messages: Vec::new(),
            input: Input::default(),
            active_tab: Tab::Messages,
            send_state: SendState::Idle,
            toast: None,
            search: None,
            contact_add_dialog: None,
            contact_remove_dialog: None,
            avatar_dialog: None,
            search_dialog: None,
            help_dialog: false,
        }
    }

    /// Fold one session event into the view state.
    pub fn apply_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::ContactsChanged(contacts) => self.contacts = contacts,
            SessionEvent::SelectionChanged(selected) => {
                let switched = selected.as_ref().map(|u| &u.id) != self.selected.as_ref().map(|u| &u.id);
                if switched {
                    self.messages.clear();
                    self.search = None;
                }
                self.selected = selected;
            }
            SessionEvent::MessagesChanged { messages, .. } => self.messages = messages,
            SessionEvent::SendStateChanged(state) => self.send_state = state,
            SessionEvent::ProfileChanged(profile) => self.profile = profile,
            SessionEvent::Notice(notice) => self.show_notice(notice),
            SessionEvent::SignedOut => {
                self.show_notice(Notice::info("Signed out", "Your session has ended."));
            }
        }
    }

    pub fn show_notice(&mut self, notice: Notice) {
        debug!("UI: showing notice '{}'", notice.title);
        self.toast = Some(Toast {
            notice,
            shown_at: Instant::now(),
        });
    }

    /// Drop the toast once it has been visible for `timeout`
    pub fn clean_notices(&mut self, timeout: Duration) {
        if let Some(toast) = &self.toast {
            if toast.shown_at.elapsed() > timeout {
                self.toast = None;
            }
        }
    }

    pub fn search_query(&self) -> Option<String> {
        self.search.as_ref().map(|search| search.query.clone())
    }

    /// Show `messages` as the result of `query`; an empty query ends the search.
    pub fn set_search_results(&mut self, query: &str, messages: Vec<Message>) {
        if query.is_empty() {
            self.search = None;
        } else {
            self.search = Some(SearchResults {
                query: query.to_string(),
                messages,
            });
        }
    }

    fn selected_index(&self) -> Option<usize> {
        let selected = self.selected.as_ref()?;
        self.contacts.iter().position(|user| user.id == selected.id)
    }

    fn step_selection(&self, forward: bool) -> Option<UiAction> {
        if self.contacts.is_empty() {
            return None;
        }
        let len = self.contacts.len();
        let next = match self.selected_index() {
            Some(index) if forward => (index + 1) % len,
            Some(index) => (index + len - 1) % len,
            None => 0,
        };
        let contact = &self.contacts[next];
        if self.selected.as_ref().map(|u| &u.id) == Some(&contact.id) {
            return None;
        }
        Some(UiAction::Select(contact.id.clone()))
    }

    fn read_key() -> Result<Option<KeyEvent>> {
        if event::poll(Duration::from_millis(10))? {
            if let Event::Key(key) = event::read()? {
                if key.kind == KeyEventKind::Press {
                    return Ok(Some(key));
                }
            }
        }
        Ok(None)
    }

    pub fn handle_input(&mut self) -> Result<Option<UiAction>> {
        let Some(key) = Self::read_key()? else {
            return Ok(None);
        };

        if let Some(dialog) = &self.contact_remove_dialog {
            match key.code {
                KeyCode::Char('y') | KeyCode::Char('Y') => {
                    let user_id = dialog.user_id.clone();
                    self.contact_remove_dialog = None;
                    return Ok(Some(UiAction::RemoveContact(user_id)));
                }
                KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                    self.contact_remove_dialog = None;
                }
                _ => {}
            }
            return Ok(None);
        }

        if let Some(input) = self.contact_add_dialog.as_mut() {
            match key.code {
                KeyCode::Esc => self.contact_add_dialog = None,
                KeyCode::Enter => {
                    let email = input.value().trim().to_string();
                    if !email.is_empty() {
                        self.contact_add_dialog = None;
                        return Ok(Some(UiAction::AddContact(email)));
                    }
                }
                _ => {
                    input.handle_event(&Event::Key(key));
                }
            }
            return Ok(None);
        }

        if let Some(input) = self.avatar_dialog.as_mut() {
            match key.code {
                KeyCode::Esc => self.avatar_dialog = None,
                KeyCode::Enter => {
                    let url = input.value().trim().to_string();
                    if !url.is_empty() {
                        self.avatar_dialog = None;
                        return Ok(Some(UiAction::UpdateAvatar(url)));
                    }
                }
                _ => {
                    input.handle_event(&Event::Key(key));
                }
            }
            return Ok(None);
        }

        if let Some(input) = self.search_dialog.as_mut() {
            match key.code {
                KeyCode::Esc => {
                    self.search_dialog = None;
                    return Ok(Some(UiAction::Search(String::new())));
                }
                KeyCode::Enter => {
                    let query = input.value().to_string();
                    self.search_dialog = None;
                    return Ok(Some(UiAction::Search(query)));
                }
                _ => {
                    input.handle_event(&Event::Key(key));
                }
            }
            return Ok(None);
        }

        if self.help_dialog {
            // Any key closes help
            self.help_dialog = false;
            return Ok(None);
        }

        let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
        match key.code {
            KeyCode::Esc if self.search.is_some() => {
                return Ok(Some(UiAction::Search(String::new())));
            }
            KeyCode::Esc => return Ok(Some(UiAction::Quit)),
            KeyCode::Tab => {
                self.active_tab = match self.active_tab {
                    Tab::Messages => Tab::Contacts,
                    Tab::Contacts => Tab::Messages,
                };
            }
            KeyCode::Char('a') if ctrl => self.contact_add_dialog = Some(Input::default()),
            KeyCode::Char('d') if ctrl => {
                if let Some(selected) = &self.selected {
                    self.contact_remove_dialog = Some(ContactRemoveDialog {
                        user_id: selected.id.clone(),
                        name: selected.name.clone(),
                    });
                }
            }
            KeyCode::Char('p') if ctrl => {
                self.avatar_dialog = Some(Input::default().with_value(self.profile.avatar_url.clone()));
            }
            KeyCode::Char('f') if ctrl => {
                let current = self.search_query().unwrap_or_default();
                self.search_dialog = Some(Input::default().with_value(current));
            }
            KeyCode::Char('l') if ctrl => return Ok(Some(UiAction::SignOut)),
            KeyCode::Char('h') if ctrl => self.help_dialog = true,
            KeyCode::Up => {
                if let Tab::Contacts = self.active_tab {
                    return Ok(self.step_selection(false));
                }
            }
            KeyCode::Down => {
                if let Tab::Contacts = self.active_tab {
                    return Ok(self.step_selection(true));
                }
            }
            KeyCode::Enter => {
                // No re-entrant sends while the previous one is in flight
                if let Tab::Messages = self.active_tab {
                    let text = self.input.value().trim().to_string();
                    if !text.is_empty() && !self.send_state.is_busy() && self.selected.is_some() {
                        self.input = Input::default();
                        return Ok(Some(UiAction::Send(text)));
                    }
                }
            }
            _ => {
                if let Tab::Messages = self.active_tab {
                    self.input.handle_event(&Event::Key(key));
                }
            }
        }
        Ok(None)
    }

    pub fn draw<B: Backend>(&self, frame: &mut Frame<B>) {
        let size = frame.size();

        let chunks = Layout::default()
            .direction(Direction::Horizontal)
            .constraints([Constraint::Percentage(25), Constraint::Percentage(75)])
            .split(size);

        let chat_chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Min(5),    // Messages
                Constraint::Length(3), // Input box
                Constraint::Length(1), // Toast / help line
            ])
            .split(chunks[1]);

        self.draw_contacts(frame, chunks[0]);
        self.draw_messages(frame, chat_chunks[0]);

        let input_title = if self.send_state.is_busy() {
            format!("Message ({})", busy_label(self.send_state))
        } else {
            "Message".to_string()
        };
        let input_block = Block::default()
            .title(input_title)
            .borders(Borders::ALL)
            .border_style(match (&self.active_tab, self.send_state.is_busy()) {
                (_, true) => Style::default().fg(Color::DarkGray),
                (Tab::Messages, false) => Style::default().fg(Color::Yellow),
                _ => Style::default(),
            });
        let input_widget = Paragraph::new(self.input.value()).block(input_block);
        frame.render_widget(input_widget, chat_chunks[1]);

        self.draw_status_line(frame, chat_chunks[2]);

        if let Tab::Messages = self.active_tab {
            frame.set_cursor(
                chat_chunks[1].x + self.input.cursor() as u16 + 1,
                chat_chunks[1].y + 1,
            );
        }

        if let Some(input) = &self.contact_add_dialog {
            draw_input_dialog(
                frame,
                size,
                "Add New Contact",
                "Enter the email address of the user to add:",
                input,
            );
        }
        if let Some(dialog) = &self.contact_remove_dialog {
            draw_contact_remove_dialog(frame, dialog, size);
        }
        if let Some(input) = &self.avatar_dialog {
            draw_input_dialog(frame, size, "Edit Profile", "Enter a new avatar URL:", input);
        }
        if let Some(input) = &self.search_dialog {
            draw_input_dialog(
                frame,
                size,
                "Search Messages",
                "Filter this conversation (empty clears):",
                input,
            );
        }
        if self.help_dialog {
            draw_help_dialog(frame, size);
        }
    }

    fn draw_contacts<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let selected = self.selected_index();
        let items: Vec<ListItem> = self
            .contacts
            .iter()
            .enumerate()
            .map(|(i, contact)| {
                let marker = if Some(i) == selected { "> " } else { "  " };
                let presence = if contact.online {
                    Span::styled("● ", Style::default().fg(Color::Green))
                } else {
                    Span::styled("○ ", Style::default().fg(Color::DarkGray))
                };
                ListItem::new(Line::from(vec![
                    Span::raw(marker),
                    presence,
                    Span::raw(contact.name.clone()),
                ]))
            })
            .collect();

        let title = format!("{} (Tab to focus)", self.profile.name);
        let contacts_list = List::new(items).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(match self.active_tab {
                    Tab::Contacts => Style::default().fg(Color::Yellow),
                    _ => Style::default(),
                }),
        );
        frame.render_widget(contacts_list, area);
    }

    fn draw_messages<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let Some(contact) = &self.selected else {
            let empty = Paragraph::new(EMPTY_STATE)
                .style(Style::default().fg(Color::DarkGray))
                .alignment(Alignment::Center)
                .block(Block::default().borders(Borders::ALL).title("Messages"));
            frame.render_widget(empty, area);
            return;
        };

        let (messages, title) = match &self.search {
            Some(search) => (
                &search.messages,
                format!("{} - search: \"{}\" (Esc clears)", contact.name, search.query),
            ),
            None => {
                let presence = if contact.online { "online" } else { "offline" };
                (&self.messages, format!("{} ({})", contact.name, presence))
            }
        };

        let wrap_width = area.width.saturating_sub(2).max(1) as usize;
        let items: Vec<ListItem> = messages
            .iter()
            .flat_map(|message| {
                let time = message
                    .timestamp
                    .with_timezone(&chrono::Local)
                    .format("%H:%M")
                    .to_string();
                let mine = message.sender.id == self.profile.id;
                let who = if mine { "You" } else { message.sender.name.as_str() };
                let full = format!("[{}] {}: {}", time, who, message.text);
                let style = if mine {
                    Style::default().fg(Color::Cyan)
                } else {
                    Style::default()
                };
                wrap(&full, wrap_width)
                    .into_iter()
                    .map(|line| ListItem::new(Text::from(line.into_owned())).style(style))
                    .collect::<Vec<_>>()
            })
            .collect();

        // Keep the newest message in view
        let mut list_state = ListState::default();
        if !items.is_empty() {
            list_state.select(Some(items.len() - 1));
        }
        let list = List::new(items)
            .block(Block::default().borders(Borders::ALL).title(title))
            .highlight_style(Style::default());
        frame.render_stateful_widget(list, area, &mut list_state);
    }

    fn draw_status_line<B: Backend>(&self, frame: &mut Frame<B>, area: Rect) {
        let line = match &self.toast {
            Some(toast) => {
                let style = match toast.notice.level {
                    NoticeLevel::Info => Style::default().fg(Color::Green),
                    NoticeLevel::Error => Style::default().fg(Color::Red),
                };
                Line::from(vec![
                    Span::styled(format!("{}: ", toast.notice.title), style.add_modifier(Modifier::BOLD)),
                    Span::styled(toast.notice.description.clone(), style),
                ])
            }
            None => Line::from(Span::styled(
                "ESC quit | TAB switch | Ctrl+A add | Ctrl+D remove | Ctrl+F search | Ctrl+P avatar | Ctrl+L sign out | Ctrl+H help",
                Style::default().fg(Color::Gray),
            )),
        };
        frame.render_widget(Paragraph::new(line), area);
    }
}

fn busy_label(state: SendState) -> &'static str {
    match state {
        SendState::Filtering => "filtering...",
        SendState::Moderating => "checking message...",
        SendState::Appending => "sending...",
        SendState::Rejected => "rejected",
        SendState::Idle => "",
    }
}

fn centered(area: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(area.width.saturating_sub(4));
    let height = height.min(area.height.saturating_sub(4));
    Rect::new(
        area.x + (area.width - width) / 2,
        area.y + (area.height - height) / 2,
        width,
        height,
    )
}

fn draw_input_dialog<B: Backend>(f: &mut Frame<B>, area: Rect, title: &str, prompt: &str, input: &Input) {
    let popup_area = centered(area, 60, 7);
    let popup_block = Block::default()
        .title(title.to_string())
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Yellow));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(1), Constraint::Length(3)])
        .split(inner_area);

    f.render_widget(Paragraph::new(prompt.to_string()), chunks[0]);

    let input_widget = Paragraph::new(input.value()).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Blue)),
    );
    f.render_widget(input_widget, chunks[1]);
    f.set_cursor(chunks[1].x + input.cursor() as u16 + 1, chunks[1].y + 1);
}

fn draw_contact_remove_dialog<B: Backend>(f: &mut Frame<B>, dialog: &ContactRemoveDialog, area: Rect) {
    let popup_area = centered(area, 60, 8);
    let popup_block = Block::default()
        .title("Confirm Contact Removal")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Red));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });
    let content = vec![
        format!("Remove '{}' from your chat list?", dialog.name),
        String::new(),
        "You will also disappear from their list.".to_string(),
        String::new(),
        "Press [Y] to confirm or [N]/[ESC] to cancel".to_string(),
    ];
    let content_list = List::new(content.into_iter().map(ListItem::new).collect::<Vec<_>>());
    f.render_widget(content_list, inner_area);
}

fn draw_help_dialog<B: Backend>(f: &mut Frame<B>, area: Rect) {
    let popup_area = centered(area, 64, 20);
    let popup_block = Block::default()
        .title("Keyboard Shortcuts")
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan));

    f.render_widget(Clear, popup_area);
    f.render_widget(popup_block, popup_area);

    let inner_area = popup_area.inner(&Margin {
        vertical: 1,
        horizontal: 2,
    });

    let shortcuts = [
        ("General", ""),
        ("ESC", "Quit (or clear an active search)"),
        ("Tab", "Switch between Messages and Contacts"),
        ("Ctrl+L", "Sign out"),
        ("", ""),
        ("Contacts", ""),
        ("Up/Down", "Select a contact (Contacts focused)"),
        ("Ctrl+A", "Add a contact by email"),
        ("Ctrl+D", "Remove the selected contact"),
        ("", ""),
        ("Messages", ""),
        ("Enter", "Send message (Messages focused)"),
        ("Ctrl+F", "Search this conversation"),
        ("Ctrl+P", "Change your avatar"),
        ("", ""),
        ("Press any key to close this dialog", ""),
    ];

    let items: Vec<ListItem> = shortcuts
        .iter()
        .map(|(key, desc)| {
            if desc.is_empty() {
                if key.is_empty() {
                    ListItem::new("")
                } else {
                    ListItem::new(Text::styled(
                        key.to_string(),
                        Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD),
                    ))
                }
            } else {
                ListItem::new(Line::from(vec![
                    Span::styled(format!("{:<10}", key), Style::default().fg(Color::Green)),
                    Span::raw(desc.to_string()),
                ]))
            }
        })
        .collect();
    f.render_widget(List::new(items), inner_area);
}

pub fn setup_terminal() -> Result<Terminal<CrosstermBackend<io::Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;
    Ok(terminal)
}

pub fn restore_terminal(mut terminal: Terminal<CrosstermBackend<io::Stdout>>) -> Result<()> {
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    Ok(())
}
